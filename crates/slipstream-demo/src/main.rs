use anyhow::Context;
use std::path::Path;

use rsa::pkcs1::EncodeRsaPrivateKey;
use rsa::pkcs8::EncodePublicKey;
use rsa::{RsaPrivateKey, RsaPublicKey};

use slipstream_updater::{
    build_package, run_from_most_recent, Strategy, UpdateInfo, UpdaterConfig,
    MAGIC_RELAUNCH_EXIT_CODE,
};

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() < 2 {
        eprintln!("Usage:");
        eprintln!("  slipstream-demo run <config.toml> [workload args...]");
        eprintln!("  slipstream-demo pack <input_dir> <output_dir> <private_key.pem> <version> <displayname> <package_url>");
        eprintln!("  slipstream-demo keygen <private_key.pem> <public_key.pem>");
        std::process::exit(2);
    }

    match args[1].as_str() {
        "run" => {
            let config_path = match args.get(2) {
                Some(path) => path,
                None => {
                    eprintln!("missing config.toml path");
                    std::process::exit(2);
                }
            };
            let config = match UpdaterConfig::load_from_file(Path::new(config_path)) {
                Ok(config) => config,
                Err(e) => {
                    eprintln!("failed to load {config_path}: {e}");
                    std::process::exit(2);
                }
            };
            let workload_args: Vec<String> = args[3..].to_vec();
            let code = run_from_most_recent(config, demo_workload, &workload_args, Strategy::InstallDuring);
            std::process::exit(code);
        }
        "pack" => {
            if let Err(e) = pack(&args[2..]) {
                eprintln!("pack failed: {e:#}");
                std::process::exit(1);
            }
        }
        "keygen" => {
            if let Err(e) = keygen(&args[2..]) {
                eprintln!("keygen failed: {e:#}");
                std::process::exit(1);
            }
        }
        other => {
            eprintln!("unknown mode: {other}");
            std::process::exit(2);
        }
    }
}

/// The wrapped application: prints its identity and argument vector.
///
/// Exits with the magic relaunch code when asked to, so the supervisor
/// loop can be demonstrated end to end.
fn demo_workload(args: &[String]) -> i32 {
    println!("slipstream-demo workload v{}", env!("CARGO_PKG_VERSION"));
    println!("args: {args:?}");

    if args.iter().any(|a| a == "--request-relaunch") {
        println!("requesting relaunch (exit {MAGIC_RELAUNCH_EXIT_CODE})");
        return MAGIC_RELAUNCH_EXIT_CODE;
    }
    0
}

/// Build a signed update package from a directory tree.
fn pack(args: &[String]) -> anyhow::Result<()> {
    let [input, output, key_path, version, displayname, package_url] = args else {
        anyhow::bail!(
            "usage: pack <input_dir> <output_dir> <private_key.pem> <version> <displayname> <package_url>"
        );
    };

    let pem = std::fs::read_to_string(key_path)
        .with_context(|| format!("reading private key {key_path}"))?;
    let key: RsaPrivateKey = rsa::pkcs8::DecodePrivateKey::from_pkcs8_pem(&pem)
        .or_else(|_| rsa::pkcs1::DecodeRsaPrivateKey::from_pkcs1_pem(&pem))
        .context("parsing private key PEM")?;

    let template = UpdateInfo {
        displayname: displayname.clone(),
        version: version.clone(),
        release_time: chrono_epoch(),
        release_type: "stable".to_string(),
        compressed_size: 0,
        md5: None,
        sha256: None,
        remote_urls: Some(vec![package_url.clone()]),
        uncompressed_size: 0,
        files: None,
    };

    let remote = build_package(Path::new(input), &template, Path::new(output), &key)
        .context("building package")?;

    println!(
        "built {output}/package.zip ({} bytes, version {})",
        remote.compressed_size,
        remote.parsed_version()
    );
    Ok(())
}

fn chrono_epoch() -> chrono::DateTime<chrono::Utc> {
    chrono::DateTime::UNIX_EPOCH
}

/// Generate an RSA keypair for package signing.
fn keygen(args: &[String]) -> anyhow::Result<()> {
    let [private_path, public_path] = args else {
        anyhow::bail!("usage: keygen <private_key.pem> <public_key.pem>");
    };

    println!("generating 2048-bit RSA key...");
    let mut rng = rand::thread_rng();
    let private = RsaPrivateKey::new(&mut rng, 2048).context("generating key")?;
    let public = RsaPublicKey::from(&private);

    let private_pem = private
        .to_pkcs1_pem(rsa::pkcs8::LineEnding::LF)
        .context("encoding private key")?;
    std::fs::write(private_path, private_pem.as_bytes())?;

    let public_pem = public
        .to_public_key_pem(rsa::pkcs8::LineEnding::LF)
        .context("encoding public key")?;
    std::fs::write(public_path, public_pem.as_bytes())?;

    println!("wrote {private_path} and {public_path}");
    Ok(())
}
