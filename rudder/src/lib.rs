pub mod config;
pub mod controller;
pub mod http;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("config error: {0}")]
    ConfigError(#[from] config::ConfigError),

    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("kube error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("kubeconfig error: {0}")]
    KubeConfig(#[from] kube::config::KubeconfigError),

    #[error("controller error: {0}")]
    ControllerError(#[from] rudder_reconciler::Error),

    #[error("task failed to complete: {0}")]
    Join(#[from] tokio::task::JoinError),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
