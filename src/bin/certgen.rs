//! Writes the bootstrap certificates of the hub proxy server and the agent.

use std::path::{Path, PathBuf};

use base64::{engine::general_purpose::STANDARD, Engine};
use clap::Parser;

use foundation_operator::pki::{generate_bootstrap_bundle, CertBundle};

const SUBJECTS: [(&str, &[&str]); 2] = [
    (
        "acm-apiserver",
        &[
            "acm-proxyserver",
            "acm-proxyserver.open-cluster-management",
            "acm-proxyserver.open-cluster-management.svc",
        ],
    ),
    ("acm-agent", &[]),
];

#[derive(Debug, clap::Parser)]
struct Arguments {
    /// Directory the PEM files are written to
    #[arg(long, default_value = ".")]
    path: PathBuf,
}

fn write_bundle(dir: &Path, subject: &str, bundle: &CertBundle) -> anyhow::Result<()> {
    for (suffix, pem) in [
        ("client", &bundle.cert_pem),
        ("ca", &bundle.ca_pem),
        ("key", &bundle.key_pem),
    ] {
        let file = dir.join(format!("{subject}-{suffix}.pem"));
        std::fs::write(&file, STANDARD.encode(pem))?;
        println!("wrote {}", file.display());
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let args = Arguments::parse();
    std::fs::create_dir_all(&args.path)?;
    for (subject, dns_names) in SUBJECTS {
        let bundle = generate_bootstrap_bundle(subject, dns_names)?;
        write_bundle(&args.path, subject, &bundle)?;
    }
    Ok(())
}
