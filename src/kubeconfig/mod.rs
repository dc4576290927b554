// src/kubeconfig/mod.rs
pub mod kube;

pub use kube::{build_kubeconfig, kubelet_user, KubeConfig, LOCAL_APISERVER};
