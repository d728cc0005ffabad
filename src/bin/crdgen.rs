use kube::CustomResourceExt;

fn main() -> anyhow::Result<()> {
    print!(
        "{}",
        serde_yaml::to_string(&foundation_operator::resources::baremetalassets::BareMetalAsset::crd())?
    );
    Ok(())
}
