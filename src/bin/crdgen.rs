use kube::CustomResourceExt;
use review_operator::crd::ReviewCluster;

fn main() -> anyhow::Result<()> {
    print!("{}", serde_yaml::to_string(&ReviewCluster::crd())?);
    Ok(())
}
