use crate::{
    ClientError, Clients, Lister, Reconciler, ResourceId, SharedStore, StatusManager, Store,
    Stores, Writer,
};
use istio_ingress_controller_core::{ConfigSnapshot, GatewaysByVisibility, HashProbeInjector};
use istio_ingress_controller_k8s_api::{
    ingress::{
        HttpIngressPath, HttpIngressRuleValue, IngressBackend, IngressBackendSplit, IngressRule,
        IngressTls, INGRESS_CLASS_ANNOTATION, ISTIO_INGRESS_CLASS,
    },
    istio::{
        gateway::{Port, Server},
        DestinationRule, Gateway, GatewaySpec, VirtualService,
    },
    ByteString, Endpoints, Ingress, IngressSpec, IntOrString, ObjectMeta, Resource, ResourceExt,
    Secret, Service, ServiceSpec, Visibility,
};
use kubert::index::IndexNamespacedResource;
use maplit::btreemap;
use parking_lot::Mutex;
use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc,
};

mod lister;

pub const CLUSTER_DOMAIN: &str = "cluster.local";

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Op {
    Create,
    Update,
    Delete,
}

/// A write recorded by the fake cluster.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Write {
    pub op: Op,
    pub kind: String,
    pub namespace: String,
    pub name: String,
}

/// An in-memory cluster: listers read from the stores and writers apply
/// straight back to them.
pub struct FakeCluster {
    pub gateways: SharedStore<Gateway>,
    pub virtual_services: SharedStore<VirtualService>,
    pub destination_rules: SharedStore<DestinationRule>,
    pub secrets: SharedStore<Secret>,
    pub services: SharedStore<Service>,
    pub endpoints: SharedStore<Endpoints>,
    pub status: Arc<FakeStatus>,
    writes: Arc<Mutex<Vec<Write>>>,
}

struct FakeWriter<K> {
    store: SharedStore<K>,
    writes: Arc<Mutex<Vec<Write>>>,
}

#[derive(Debug)]
pub struct FakeStatus {
    ready: AtomicBool,
    pub calls: AtomicUsize,
}

// === impl FakeCluster ===

impl Default for FakeCluster {
    fn default() -> Self {
        Self {
            gateways: Store::shared(),
            virtual_services: Store::shared(),
            destination_rules: Store::shared(),
            secrets: Store::shared(),
            services: Store::shared(),
            endpoints: Store::shared(),
            status: Arc::new(FakeStatus {
                ready: AtomicBool::new(true),
                calls: AtomicUsize::new(0),
            }),
            writes: Default::default(),
        }
    }
}

impl FakeCluster {
    pub fn stores(&self) -> Stores {
        Stores {
            gateways: self.gateways.clone(),
            virtual_services: self.virtual_services.clone(),
            destination_rules: self.destination_rules.clone(),
            secrets: self.secrets.clone(),
            services: self.services.clone(),
            endpoints: self.endpoints.clone(),
        }
    }

    pub fn reconciler(&self) -> Reconciler {
        let clients = Clients {
            gateways: self.writer(&self.gateways),
            virtual_services: self.writer(&self.virtual_services),
            destination_rules: self.writer(&self.destination_rules),
            secrets: self.writer(&self.secrets),
        };
        Reconciler::new(
            self.stores(),
            clients,
            self.status.clone(),
            Arc::new(HashProbeInjector),
        )
    }

    fn writer<K>(&self, store: &SharedStore<K>) -> Arc<FakeWriter<K>> {
        Arc::new(FakeWriter {
            store: store.clone(),
            writes: self.writes.clone(),
        })
    }

    pub fn writes(&self) -> Vec<String> {
        self.writes.lock().iter().map(Write::describe).collect()
    }

    pub fn writes_of(&self, op: Op) -> Vec<String> {
        self.writes
            .lock()
            .iter()
            .filter(|w| w.op == op)
            .map(Write::describe)
            .collect()
    }

    pub fn clear_writes(&self) {
        self.writes.lock().clear();
    }

    pub fn set_ready(&self, ready: bool) {
        self.status.ready.store(ready, Ordering::SeqCst);
    }
}

// === impl Write ===

impl Write {
    /// Renders the write as `<Op> <Kind> <namespace>/<name>`.
    pub fn describe(&self) -> String {
        format!("{:?} {} {}/{}", self.op, self.kind, self.namespace, self.name)
    }
}

// === impl FakeWriter ===

impl<K: Resource<DynamicType = ()>> FakeWriter<K> {
    fn record(&self, op: Op, namespace: &str, name: &str) {
        self.writes.lock().push(Write {
            op,
            kind: K::kind(&()).to_string(),
            namespace: namespace.to_string(),
            name: name.to_string(),
        });
    }
}

#[async_trait::async_trait]
impl<K> Writer<K> for FakeWriter<K>
where
    K: Resource<DynamicType = ()> + Clone + Send + Sync + 'static,
{
    async fn create(&self, mut resource: K) -> Result<K, ClientError> {
        let namespace = resource.namespace().unwrap_or_default();
        let name = resource.name_any();
        if self.store.get(&namespace, &name).is_some() {
            return Err(ClientError::Conflict);
        }
        resource.meta_mut().uid = Some(format!("{name}-uid"));
        self.record(Op::Create, &namespace, &name);
        self.store.write().apply(resource.clone());
        Ok(resource)
    }

    async fn update(&self, resource: K) -> Result<K, ClientError> {
        let namespace = resource.namespace().unwrap_or_default();
        let name = resource.name_any();
        if self.store.get(&namespace, &name).is_none() {
            return Err(ClientError::NotFound);
        }
        self.record(Op::Update, &namespace, &name);
        self.store.write().apply(resource.clone());
        Ok(resource)
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<(), ClientError> {
        if self.store.get(namespace, name).is_none() {
            return Err(ClientError::NotFound);
        }
        self.record(Op::Delete, namespace, name);
        self.store
            .write()
            .delete(namespace.to_string(), name.to_string());
        Ok(())
    }
}

// === impl FakeStatus ===

#[async_trait::async_trait]
impl StatusManager for FakeStatus {
    async fn is_ready(
        &self,
        _ing: &Ingress,
        _gateways: &GatewaysByVisibility,
    ) -> anyhow::Result<bool> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.ready.load(Ordering::SeqCst))
    }

    fn forget(&self, _ingress: &ResourceId) {}
}

// === helpers ===

pub fn config() -> ConfigSnapshot {
    ConfigSnapshot::new(CLUSTER_DOMAIN)
}

pub fn make_ingress(rules: Vec<IngressRule>, tls: Vec<IngressTls>) -> Ingress {
    Ingress {
        metadata: ObjectMeta {
            name: Some("reconciling-ingress".to_string()),
            namespace: Some("test-ns".to_string()),
            uid: Some("ingress-uid".to_string()),
            generation: Some(1),
            annotations: Some(btreemap! {
                INGRESS_CLASS_ANNOTATION.to_string() => ISTIO_INGRESS_CLASS.to_string(),
            }),
            ..Default::default()
        },
        spec: IngressSpec {
            rules,
            tls,
            http_option: None,
        },
        status: None,
    }
}

pub fn make_rule(hosts: &[&str], visibility: Visibility) -> IngressRule {
    IngressRule {
        hosts: hosts.iter().map(ToString::to_string).collect(),
        visibility,
        http: Some(HttpIngressRuleValue {
            paths: vec![HttpIngressPath {
                splits: vec![IngressBackendSplit {
                    backend: IngressBackend {
                        service_namespace: "test-ns".to_string(),
                        service_name: "hello".to_string(),
                        service_port: IntOrString::Int(80),
                    },
                    percent: 100,
                    append_headers: Default::default(),
                }],
                ..Default::default()
            }],
        }),
    }
}

pub fn make_tls(hosts: &[&str], namespace: &str, name: &str) -> IngressTls {
    IngressTls {
        hosts: hosts.iter().map(ToString::to_string).collect(),
        secret_name: name.to_string(),
        secret_namespace: namespace.to_string(),
    }
}

pub fn make_gateway_service(namespace: &str, name: &str) -> Service {
    Service {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(btreemap! {"istio".to_string() => "ingress".to_string()}),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            selector: Some(btreemap! {"istio".to_string() => "ingress".to_string()}),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn make_gateway(namespace: &str, name: &str, servers: Vec<Server>) -> Gateway {
    Gateway {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        spec: GatewaySpec {
            selector: btreemap! {"istio".to_string() => "ingress".to_string()},
            servers,
        },
    }
}

pub fn make_server(port_name: &str, protocol: &str, number: u32) -> Server {
    Server {
        hosts: vec!["*".to_string()],
        port: Port {
            number,
            protocol: protocol.to_string(),
            name: port_name.to_string(),
        },
        tls: None,
    }
}

/// Builds a TLS Secret holding a self-signed certificate for `dns_names`.
pub fn make_cert_secret(namespace: &str, name: &str, dns_names: &[&str]) -> Secret {
    let cert = rcgen::generate_simple_self_signed(
        dns_names.iter().map(ToString::to_string).collect::<Vec<_>>(),
    )
    .expect("certificate must be generated");
    Secret {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            uid: Some(format!("{name}-uid")),
            ..Default::default()
        },
        data: Some(btreemap! {
            "tls.crt".to_string() => ByteString(cert.cert.pem().into_bytes()),
            "tls.key".to_string() => ByteString(cert.key_pair.serialize_pem().into_bytes()),
        }),
        type_: Some("kubernetes.io/tls".to_string()),
        ..Default::default()
    }
}
