use kmm_operator::crd::{ManagedClusterModule, Module, NodeModulesConfig};
use kube::CustomResourceExt;

fn main() -> anyhow::Result<()> {
    print!("{}", serde_yaml::to_string(&Module::crd())?);
    println!("---");
    print!("{}", serde_yaml::to_string(&NodeModulesConfig::crd())?);
    println!("---");
    print!("{}", serde_yaml::to_string(&ManagedClusterModule::crd())?);
    Ok(())
}
