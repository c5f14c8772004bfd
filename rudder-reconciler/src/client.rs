use std::fmt::Debug;
use std::future::Future;

use k8s_openapi::NamespaceResourceScope;
use k8s_openapi::serde::de::DeserializeOwned;
use kube::{Api, Client, Resource};
use thiserror::Error;

use crate::RequestIdentity;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("resource not found")]
    NotFound,

    #[error("kube error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("{0}")]
    Other(String),
}

impl ClientError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ClientError::NotFound)
    }
}

/// Read access to cluster state by identity.
///
/// A missing object must be reported as [`ClientError::NotFound`] so the
/// executor can tell a deleted resource apart from a failed request.
pub trait ResourceClient<K>: Send + Sync {
    fn get(
        &self,
        identity: &RequestIdentity,
    ) -> impl Future<Output = Result<K, ClientError>> + Send;
}

/// [`ResourceClient`] backed by the Kubernetes API server.
#[derive(Clone)]
pub struct KubeClient {
    client: Client,
}

impl KubeClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

impl<K> ResourceClient<K> for KubeClient
where
    K: Resource<Scope = NamespaceResourceScope>,
    K: DeserializeOwned + Clone + Debug + Send + Sync + 'static,
    <K as Resource>::DynamicType: Default,
{
    async fn get(&self, identity: &RequestIdentity) -> Result<K, ClientError> {
        let api: Api<K> = Api::namespaced(self.client.clone(), identity.namespace());
        api.get_opt(identity.name())
            .await?
            .ok_or(ClientError::NotFound)
    }
}
