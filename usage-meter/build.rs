use std::{
    env, fs,
    io::{BufRead, BufReader},
    path::{Path, PathBuf},
    process::{Command, Stdio},
    thread,
};

use anyhow::{Context as _, Result, anyhow, bail};
use aya_build::{Package, Toolchain};
use cargo_metadata::{Artifact, CompilerMessage, Message, MetadataCommand};

const EBPF_PACKAGE: &str = "usage-meter-ebpf";
/// Binary name of the eBPF object; the daemon embeds `$OUT_DIR/usage-meter`.
const EBPF_OBJECT: &str = "usage-meter";
const SKIP_ENV: &str = "USAGE_METER_SKIP_EBPF";

fn main() -> Result<()> {
    println!("cargo:rerun-if-env-changed={SKIP_ENV}");
    let out_dir = PathBuf::from(env::var_os("OUT_DIR").ok_or(anyhow!("OUT_DIR not set"))?);

    if env::var_os(SKIP_ENV).is_some() {
        println!("cargo:warning={SKIP_ENV} set, embedding an empty eBPF object");
        return write_placeholder(&out_dir);
    }

    let root_dir = ebpf_package_dir()?;
    let package = Package {
        name: EBPF_PACKAGE,
        root_dir: &root_dir,
        ..Default::default()
    };
    if let Err(err) = compile_ebpf(&package, Toolchain::default(), &out_dir) {
        // Userspace still builds and tests without a bpf toolchain; loading fails at runtime.
        println!("cargo:warning=eBPF build failed, embedding an empty object: {err:#}");
        return write_placeholder(&out_dir);
    }
    Ok(())
}

fn ebpf_package_dir() -> Result<String> {
    let metadata = MetadataCommand::new()
        .no_deps()
        .exec()
        .context("failed to read workspace metadata")?;
    let package = metadata
        .packages
        .into_iter()
        .find(|p| p.name.as_str() == EBPF_PACKAGE)
        .ok_or_else(|| anyhow!("{EBPF_PACKAGE} package not found"))?;
    let dir = package
        .manifest_path
        .parent()
        .ok_or_else(|| anyhow!("no parent for {}", package.manifest_path))?;
    Ok(dir.to_string())
}

fn bpf_target() -> Result<(String, String)> {
    let endian = env::var("CARGO_CFG_TARGET_ENDIAN").context("CARGO_CFG_TARGET_ENDIAN not set")?;
    let triple = match endian.as_str() {
        "little" => "bpfel-unknown-none",
        "big" => "bpfeb-unknown-none",
        other => bail!("unsupported endian={other}"),
    };
    let arch = env::var("CARGO_CFG_TARGET_ARCH").context("CARGO_CFG_TARGET_ARCH not set")?;
    let arch = if arch.starts_with("riscv64") {
        "riscv64".to_string()
    } else {
        arch
    };
    Ok((triple.to_string(), arch))
}

fn compile_ebpf(package: &Package<'_>, toolchain: Toolchain<'_>, out_dir: &Path) -> Result<()> {
    println!("cargo:rerun-if-changed={}", package.root_dir);
    let (target, arch) = bpf_target()?;
    let toolchain = match toolchain {
        Toolchain::Nightly => "nightly",
        Toolchain::Custom(name) => name,
    };

    let mut cmd = Command::new("rustup");
    cmd.args(["run", toolchain, "cargo", "build", "--package", package.name])
        .args(["-Z", "build-std=core", "--bins", "--release"])
        .args(["--message-format=json", "--target", &target])
        .arg("--target-dir")
        .arg(out_dir.join(package.name));
    if package.no_default_features {
        cmd.arg("--no-default-features");
    }
    if !package.features.is_empty() {
        cmd.args(["--features", &package.features.join(",")]);
    }
    let rustflags = [
        format!("--cfg=bpf_target_arch=\"{arch}\""),
        "-Cdebuginfo=2".to_string(),
        "-Clink-arg=--btf".to_string(),
    ]
    .join("\x1f");
    cmd.env("CARGO_ENCODED_RUSTFLAGS", rustflags)
        .env_remove("RUSTC")
        .env_remove("RUSTC_WORKSPACE_WRAPPER")
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = cmd
        .spawn()
        .with_context(|| format!("failed to spawn {cmd:?}"))?;
    let stderr = child.stderr.take().context("child stderr not captured")?;
    let stdout = child.stdout.take().context("child stdout not captured")?;

    let relay = thread::spawn(move || {
        for line in BufReader::new(stderr).lines().map_while(|line| line.ok()) {
            eprintln!("[ebpf] {line}");
        }
    });

    let mut objects = Vec::new();
    for message in Message::parse_stream(BufReader::new(stdout)) {
        match message.context("invalid cargo message")? {
            Message::CompilerArtifact(Artifact {
                executable: Some(executable),
                target,
                ..
            }) => objects.push((target.name, executable.into_std_path_buf())),
            Message::CompilerMessage(CompilerMessage { message, .. }) => {
                for line in message.rendered.iter().flat_map(|r| r.lines()) {
                    eprintln!("[ebpf] {line}");
                }
            }
            Message::TextLine(line) => eprintln!("[ebpf] {line}"),
            _ => {}
        }
    }

    let status = child.wait().context("failed to wait for eBPF build")?;
    relay
        .join()
        .map_err(|_| anyhow!("stderr relay thread panicked"))?;
    if !status.success() {
        bail!("eBPF build exited with {status}");
    }

    for (name, binary) in objects {
        let dst = out_dir.join(&name);
        fs::copy(&binary, &dst)
            .with_context(|| format!("failed to copy {} to {}", binary.display(), dst.display()))?;
    }
    if !out_dir.join(EBPF_OBJECT).exists() {
        bail!("eBPF build produced no {EBPF_OBJECT} object");
    }
    Ok(())
}

fn write_placeholder(out_dir: &Path) -> Result<()> {
    let dst = out_dir.join(EBPF_OBJECT);
    fs::write(&dst, b"").with_context(|| format!("failed to write {}", dst.display()))
}
