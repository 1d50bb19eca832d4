use std::{env, fs, path::PathBuf};

use anyhow::{Context as _, anyhow};
use aya_build::{Package, Toolchain};

const EBPF_PACKAGE: &str = "flowlens-ebpf";
const EBPF_BINARY: &str = "flowlens";

fn main() -> anyhow::Result<()> {
    let out_dir = PathBuf::from(env::var_os("OUT_DIR").ok_or(anyhow!("OUT_DIR not set"))?);
    println!("cargo:rerun-if-env-changed=CARGO_FEATURE_EMBED_PROGRAM");

    // Without the feature the agent loads the classifier from `program_path`
    // at runtime, so leave an empty placeholder for `include_bytes_aligned!`.
    if env::var_os("CARGO_FEATURE_EMBED_PROGRAM").is_none() {
        fs::write(out_dir.join(EBPF_BINARY), [])
            .context("failed to write empty program placeholder")?;
        return Ok(());
    }

    let manifest_dir = PathBuf::from(
        env::var_os("CARGO_MANIFEST_DIR").ok_or(anyhow!("CARGO_MANIFEST_DIR not set"))?,
    );
    let ebpf_manifest = manifest_dir
        .parent()
        .ok_or_else(|| anyhow!("no parent for {}", manifest_dir.display()))?
        .join(EBPF_PACKAGE)
        .join("Cargo.toml");

    // The eBPF crate is its own workspace root, so ask it directly.
    let cargo_metadata::Metadata { packages, .. } = cargo_metadata::MetadataCommand::new()
        .manifest_path(&ebpf_manifest)
        .no_deps()
        .exec()
        .context("MetadataCommand::exec")?;
    let cargo_metadata::Package {
        name,
        manifest_path,
        ..
    } = packages
        .into_iter()
        .find(|cargo_metadata::Package { name, .. }| name.as_str() == EBPF_PACKAGE)
        .ok_or_else(|| anyhow!("{EBPF_PACKAGE} package not found"))?;
    let root_dir = manifest_path
        .parent()
        .ok_or_else(|| anyhow!("no parent for {manifest_path}"))?;

    let ebpf_package = Package {
        name: name.as_str(),
        root_dir: root_dir.as_str(),
        ..Default::default()
    };
    aya_build::build_ebpf([ebpf_package], Toolchain::default())
}
