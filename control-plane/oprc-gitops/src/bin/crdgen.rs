use kube::core::CustomResourceExt;
use oprc_gitops::crd::{ClusterGitOpsPlatform, GitOpsPlatform};

fn main() {
    let namespaced = serde_yaml::to_string(&GitOpsPlatform::crd())
        .expect("serialize CRD to YAML");
    let cluster = serde_yaml::to_string(&ClusterGitOpsPlatform::crd())
        .expect("serialize CRD to YAML");
    println!("{}---\n{}", namespaced, cluster);
}
