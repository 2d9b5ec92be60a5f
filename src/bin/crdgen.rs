use kmm_operator::crd::Module;
use kube::CustomResourceExt;

fn main() -> anyhow::Result<()> {
    print!("{}", serde_yaml::to_string(&Module::crd())?);
    Ok(())
}
