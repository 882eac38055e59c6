// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Test utilities for mocking Kubernetes API responses and seeding caches.

use crate::constants::controller::DEPLOYMENT_NAME;
use crate::constants::inputs::{IMAGES_CONFIG_MAP, IMAGES_JSON_KEY};
use http::{Request, Response};
use http_body_util::BodyExt;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::ObjectMeta;
use kube::client::Body;
use kube::runtime::reflector::{store::Writer, Store};
use kube::runtime::watcher;
use kube::{Client, Resource};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::hash::Hash;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use tower::Service;

pub const TEST_IMAGE: &str = "docker.io/openshift/origin-machine-api-operator:v4.0.0";

pub const IMAGES_JSON: &str = r#"{
    "clusterAPIControllerAWS": "docker.io/openshift/origin-aws-machine-controllers:v4.0.0",
    "clusterAPIControllerOpenStack": "docker.io/openshift/origin-openstack-machine-controllers:v4.0.0",
    "clusterAPIControllerLibvirt": "docker.io/openshift/origin-libvirt-machine-controllers:v4.0.0",
    "machineAPIOperator": "docker.io/openshift/origin-machine-api-operator:v4.0.0",
    "clusterAPIControllerBareMetal": "quay.io/openshift/origin-baremetal-machine-controllers:v4.0.0",
    "clusterAPIControllerAzure": "quay.io/openshift/origin-azure-machine-controllers:v4.0.0"
}"#;

/// A request the mock service received
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub method: String,
    pub path: String,
    pub body: String,
}

type ResponseQueue = VecDeque<(u16, String)>;

/// A mock HTTP service that returns predefined responses based on request paths.
///
/// Each (method, path) holds a sequence of responses; the last one repeats.
#[derive(Clone)]
pub struct MockService {
    responses: Arc<Mutex<HashMap<(String, String), ResponseQueue>>>,
    calls: Arc<Mutex<Vec<RecordedCall>>>,
}

impl MockService {
    pub fn new() -> Self {
        Self {
            responses: Arc::new(Mutex::new(HashMap::new())),
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn on(self, method: &str, path: &str, responses: Vec<(u16, String)>) -> Self {
        self.responses
            .lock()
            .unwrap()
            .insert((method.to_string(), path.to_string()), responses.into());
        self
    }

    /// Add a response for GET requests matching the exact path
    pub fn on_get(self, path: &str, status: u16, body: &str) -> Self {
        self.on("GET", path, vec![(status, body.to_string())])
    }

    /// Respond to consecutive GETs with each entry in turn
    pub fn on_get_sequence(self, path: &str, responses: Vec<(u16, String)>) -> Self {
        self.on("GET", path, responses)
    }

    /// Add a response for POST requests matching the exact path
    pub fn on_post(self, path: &str, status: u16, body: &str) -> Self {
        self.on("POST", path, vec![(status, body.to_string())])
    }

    /// Add a response for PUT requests matching the exact path
    pub fn on_put(self, path: &str, status: u16, body: &str) -> Self {
        self.on("PUT", path, vec![(status, body.to_string())])
    }

    pub fn on_put_sequence(self, path: &str, responses: Vec<(u16, String)>) -> Self {
        self.on("PUT", path, responses)
    }

    /// Build a kube Client from this mock service
    pub fn into_client(self) -> Client {
        Client::new(self, "https://kubernetes.default.svc")
    }

    /// Every request received so far, in order
    pub fn requests(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }

    /// Only the mutating requests
    pub fn writes(&self) -> Vec<RecordedCall> {
        self.requests()
            .into_iter()
            .filter(|c| c.method != "GET")
            .collect()
    }

    fn find_response(&self, method: &str, path: &str) -> Option<(u16, String)> {
        let mut responses = self.responses.lock().unwrap();

        let exact = (method.to_string(), path.to_string());
        let key = if responses.contains_key(&exact) {
            exact
        } else {
            // Fall back to a prefix match for paths with subresources
            responses
                .keys()
                .find(|(m, p)| m == method && path.starts_with(p.as_str()))
                .cloned()?
        };
        let queue = responses.get_mut(&key)?;

        if queue.len() > 1 {
            queue.pop_front()
        } else {
            queue.front().cloned()
        }
    }
}

impl Default for MockService {
    fn default() -> Self {
        Self::new()
    }
}

impl Service<Request<Body>> for MockService {
    type Response = Response<Body>;
    type Error = tower::BoxError;
    type Future = std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<Self::Response, Self::Error>> + Send>,
    >;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let method = req.method().to_string();
        let path = req.uri().path().to_string();

        let response = self.find_response(&method, &path);
        let calls = self.calls.clone();

        Box::pin(async move {
            let body = req
                .into_body()
                .collect()
                .await
                .map(|c| String::from_utf8_lossy(&c.to_bytes()).into_owned())
                .unwrap_or_default();
            calls.lock().unwrap().push(RecordedCall {
                method,
                path: path.clone(),
                body,
            });

            let (status, body) = response.unwrap_or_else(|| (404, not_found_json("resource", &path)));
            Ok(Response::builder()
                .status(status)
                .header("content-type", "application/json")
                .body(Body::from(body.into_bytes()))
                .unwrap())
        })
    }
}

/// Create a 404 not found response
pub fn not_found_json(resource: &str, name: &str) -> String {
    serde_json::json!({
        "kind": "Status",
        "apiVersion": "v1",
        "status": "Failure",
        "message": format!("{} \"{}\" not found", resource, name),
        "reason": "NotFound",
        "code": 404
    })
    .to_string()
}

/// The images ConfigMap carrying `json` under the images key
pub fn images_config_map(namespace: &str, json: &str) -> ConfigMap {
    ConfigMap {
        metadata: ObjectMeta {
            name: Some(IMAGES_CONFIG_MAP.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        data: Some(BTreeMap::from([(
            IMAGES_JSON_KEY.to_string(),
            json.to_string(),
        )])),
        ..Default::default()
    }
}

/// A bare controller Deployment with the given replica count
pub fn deployment(namespace: &str, replicas: i32) -> Deployment {
    Deployment {
        metadata: ObjectMeta {
            name: Some(DEPLOYMENT_NAME.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(replicas),
            ..Default::default()
        }),
        status: None,
    }
}

pub fn deployment_json(namespace: &str, replicas: i32) -> String {
    serde_json::to_string(&deployment(namespace, replicas)).unwrap()
}

/// A synced reflector writer seeded with `objects`, for tests that change the cache later
pub fn writer_with<K>(objects: Vec<K>) -> Writer<K>
where
    K: Resource + Clone + 'static,
    K::DynamicType: Eq + Hash + Clone + Default,
{
    let mut writer = Writer::default();
    writer.apply_watcher_event(&watcher::Event::Init);
    for obj in objects {
        writer.apply_watcher_event(&watcher::Event::InitApply(obj));
    }
    writer.apply_watcher_event(&watcher::Event::InitDone);
    writer
}

/// A reflector store holding exactly `objects`
pub fn store_with<K>(objects: Vec<K>) -> Store<K>
where
    K: Resource + Clone + 'static,
    K::DynamicType: Eq + Hash + Clone + Default,
{
    writer_with(objects).as_reader()
}
