//! Print the VMCluster CRD as YAML.

use kube::CustomResourceExt;

use vmcluster_operator::VMCluster;

fn main() -> anyhow::Result<()> {
    print!("{}", serde_yaml::to_string(&VMCluster::crd())?);
    Ok(())
}
