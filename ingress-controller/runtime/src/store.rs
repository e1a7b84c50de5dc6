use istio_ingress_controller_k8s_api::{Resource, ResourceExt};
use istio_ingress_controller_k8s_reconciler::{ClientError, Writer};
use k8s_openapi::NamespaceResourceScope;
use kube::{
    api::{DeleteParams, PostParams},
    Api, Client,
};
use serde::{de::DeserializeOwned, Serialize};
use std::{fmt, marker::PhantomData};

const FIELD_MANAGER: &str = "istio-ingress-controller";

/// Writes namespaced resources through the Kubernetes API.
pub struct KubeWriter<K> {
    client: Client,
    _kind: PhantomData<fn() -> K>,
}

// === impl KubeWriter ===

impl<K> KubeWriter<K> {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            _kind: PhantomData,
        }
    }
}

impl<K> KubeWriter<K>
where
    K: Resource<DynamicType = (), Scope = NamespaceResourceScope>,
{
    fn api(&self, namespace: &str) -> Api<K> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait::async_trait]
impl<K> Writer<K> for KubeWriter<K>
where
    K: Resource<DynamicType = (), Scope = NamespaceResourceScope>,
    K: Clone + fmt::Debug + DeserializeOwned + Serialize + Send + Sync + 'static,
{
    async fn create(&self, resource: K) -> Result<K, ClientError> {
        let namespace = resource.namespace().unwrap_or_default();
        self.api(&namespace)
            .create(&post_params(), &resource)
            .await
            .map_err(client_error)
    }

    async fn update(&self, resource: K) -> Result<K, ClientError> {
        let namespace = resource.namespace().unwrap_or_default();
        let name = resource.name_any();
        self.api(&namespace)
            .replace(&name, &post_params(), &resource)
            .await
            .map_err(client_error)
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<(), ClientError> {
        self.api(namespace)
            .delete(name, &DeleteParams::default())
            .await
            .map(|_| ())
            .map_err(client_error)
    }
}

fn post_params() -> PostParams {
    PostParams {
        field_manager: Some(FIELD_MANAGER.to_string()),
        ..Default::default()
    }
}

/// Separates the API errors the engine acts on from everything else.
fn client_error(error: kube::Error) -> ClientError {
    match error {
        kube::Error::Api(ref rsp) if rsp.code == 404 => ClientError::NotFound,
        kube::Error::Api(ref rsp) if rsp.code == 409 => ClientError::Conflict,
        error => ClientError::Other(error.into()),
    }
}
