//! Prints the CustomResourceDefinitions of the operator as a YAML stream.

use kube::CustomResourceExt;
use metrics_operator::crd::{MetricsServer, RuleGroup};

fn main() -> anyhow::Result<()> {
    let crds = [MetricsServer::crd(), RuleGroup::crd()];
    for (i, crd) in crds.iter().enumerate() {
        if i > 0 {
            println!("---");
        }
        print!("{}", serde_yaml::to_string(crd)?);
    }
    Ok(())
}
