#[cfg(feature = "embedded")]
fn main() -> anyhow::Result<()> {
    use anyhow::{Context as _, bail};
    use aya_build::cargo_metadata::{self, Package};

    let cargo_metadata::Metadata { packages, .. } = cargo_metadata::MetadataCommand::new()
        .no_deps()
        .exec()
        .context("MetadataCommand::exec")?;
    let packages: Vec<Package> = packages
        .into_iter()
        .filter(|cargo_metadata::Package { name, .. }| name.as_str() == "svclb-ebpf")
        .collect();
    if packages.is_empty() {
        bail!("failed to find svclb-ebpf package");
    }
    aya_build::build_ebpf(packages, aya_build::Toolchain::default())
}

#[cfg(not(feature = "embedded"))]
fn main() {}
