use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::mpsc::{Sender, channel};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use mcumgr_core::image::TlvEntry;
use mcumgr_core::managers::FileDownload;
use mcumgr_core::transfer::download;
use mcumgr_core::{
    CacheImage, DefaultManager, Error, FirmwareImage, FirmwareUpgrade, ImageManager,
    ManifestUpgrade, McuMgrClient, ResourceProvider, SuitManager, TracingObserver,
    TransferCallback, UdpTransport, UpgradeConfig, UpgradeMode, UpgradeOutcome,
};
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about = "SMP device management and DFU tool", long_about = None)]
struct Args {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show what an update file contains
    Inspect {
        file: PathBuf,
    },
    /// List image slots on the device
    List {
        /// Device address (host or host:port)
        #[arg(long)]
        addr: String,
    },
    /// Reboot the device
    Reset {
        #[arg(long)]
        addr: String,
    },
    /// Upgrade an MCUboot image: upload, test, reset, confirm
    Upgrade {
        #[arg(long)]
        addr: String,
        file: PathBuf,
        /// TOML upgrade configuration
        #[arg(long)]
        config: Option<PathBuf>,
        /// Upload chunks kept in flight
        #[arg(long)]
        window: Option<usize>,
        /// Flash write alignment in bytes
        #[arg(long)]
        alignment: Option<usize>,
        /// Leave the new image unconfirmed
        #[arg(long)]
        test_only: bool,
    },
    /// Upgrade with a SUIT envelope
    Suit {
        #[arg(long)]
        addr: String,
        envelope: PathBuf,
        /// Cache partition images as `<target_id>=<file>`
        #[arg(long = "cache")]
        caches: Vec<String>,
        /// Directory the device's requested resources are read from
        #[arg(long)]
        resources: Option<PathBuf>,
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Download a file from the device file system
    Download {
        #[arg(long)]
        addr: String,
        remote: String,
        local: PathBuf,
    },
}

fn main() {
    let args = Args::parse();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(if args.verbose {
                    tracing::Level::DEBUG.into()
                } else {
                    tracing::Level::INFO.into()
                })
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    if let Err(e) = run(args.command) {
        error!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn run(command: Command) -> Result<()> {
    match command {
        Command::Inspect { file } => inspect(&file),
        Command::List { addr } => {
            let images = ImageManager::new(connect(&addr)?);
            let state = images.state()?;
            for slot in &state.slots {
                println!("{slot}");
                if !slot.hash.is_empty() {
                    println!("    hash: {}", hex(&slot.hash));
                }
            }
            if let Some(split) = state.split_status {
                println!("split status: {split}");
            }
            Ok(())
        }
        Command::Reset { addr } => {
            DefaultManager::new(connect(&addr)?).reset(false)?;
            info!("Reset sent");
            Ok(())
        }
        Command::Upgrade {
            addr,
            file,
            config,
            window,
            alignment,
            test_only,
        } => {
            let mut config = load_config(config.as_deref())?;
            if let Some(window) = window {
                config.window_capacity = window;
            }
            if let Some(alignment) = alignment {
                config.memory_alignment = alignment;
            }
            if test_only {
                config.mode = UpgradeMode::TestOnly;
            }

            let data = std::fs::read(&file).with_context(|| format!("reading {}", file.display()))?;
            let image = match FirmwareImage::detect(data)? {
                FirmwareImage::McuBoot(image) => image,
                FirmwareImage::Manifest { .. } => bail!("{} is a SUIT envelope, use `suit`", file.display()),
            };
            info!(version = %image.header().version, hash = %hex(image.hash()), "Upgrading");

            let upgrade = FirmwareUpgrade::new(connect(&addr)?, image, config)?;
            report(upgrade.run(&TracingObserver)?)
        }
        Command::Suit {
            addr,
            envelope,
            caches,
            resources,
            config,
        } => {
            let config = load_config(config.as_deref())?;
            let envelope =
                std::fs::read(&envelope).with_context(|| format!("reading {}", envelope.display()))?;
            let caches = caches
                .iter()
                .map(String::as_str)
                .map(parse_cache)
                .collect::<Result<Vec<_>>>()?;
            let provider: Arc<dyn ResourceProvider> = Arc::new(DirectoryProvider {
                root: resources.unwrap_or_else(|| PathBuf::from(".")),
            });

            let client = connect(&addr)?;
            match SuitManager::new(Arc::clone(&client)).manifest_list() {
                Ok(manifests) => info!(count = manifests.len(), "Device manifests"),
                Err(e) => warn!(error = %e, "Could not list manifests"),
            }

            let upgrade = ManifestUpgrade::new(client, envelope, caches, provider, config)?;
            report(upgrade.run(&TracingObserver)?)
        }
        Command::Download {
            addr,
            remote,
            local,
        } => {
            let (tx, rx) = channel();
            let controller = download(
                connect(&addr)?,
                FileDownload {
                    name: remote.clone(),
                },
                Box::new(DownloadSink { done: tx }),
            )?;
            let result = rx.recv().context("download ended without a result")?;
            controller.wait();
            let data = result?;
            std::fs::write(&local, &data).with_context(|| format!("writing {}", local.display()))?;
            info!(remote = %remote, bytes = data.len(), "Downloaded");
            Ok(())
        }
    }
}

fn connect(addr: &str) -> Result<Arc<McuMgrClient>> {
    let transport = UdpTransport::connect(addr).with_context(|| format!("connecting to {addr}"))?;
    info!(peer = %transport.peer(), "Connected");
    Ok(Arc::new(McuMgrClient::new(Arc::new(transport))))
}

fn load_config(path: Option<&Path>) -> Result<UpgradeConfig> {
    match path {
        Some(path) => UpgradeConfig::load_from_file(path)
            .with_context(|| format!("loading config {}", path.display())),
        None => Ok(UpgradeConfig::default()),
    }
}

fn report<S: std::fmt::Display>(outcome: UpgradeOutcome<S>) -> Result<()> {
    match outcome {
        UpgradeOutcome::Completed { state } => {
            info!(state = %state, "Upgrade finished");
            Ok(())
        }
        UpgradeOutcome::Canceled { .. } => bail!("upgrade canceled"),
    }
}

fn inspect(file: &Path) -> Result<()> {
    let data = std::fs::read(file).with_context(|| format!("reading {}", file.display()))?;
    let size = data.len();

    match FirmwareImage::detect(data)? {
        FirmwareImage::McuBoot(image) => {
            let header = image.header();
            println!("format:      MCUboot{}", if header.is_legacy() { " (legacy)" } else { "" });
            println!("file size:   {size}");
            println!("version:     {}", header.version);
            println!("load addr:   {:#010x}", header.load_addr);
            println!("header size: {}", header.header_size);
            println!("image size:  {}", header.image_size);
            println!("flags:       {:#010x}", header.flags);
            if let Some(protected) = image.protected_tlv() {
                println!("protected TLVs:");
                print_entries(&protected.entries);
            }
            println!("TLVs:");
            print_entries(&image.tlv().entries);
            println!("hash:        {}", hex(image.hash()));
        }
        FirmwareImage::Manifest { digest, .. } => {
            println!("format:      SUIT envelope");
            println!("file size:   {size}");
            println!("digest:      {}", hex(&digest));
        }
    }
    Ok(())
}

fn print_entries(entries: &[TlvEntry]) {
    for entry in entries {
        println!("  type {:#04x} len {:>4}", entry.kind, entry.length);
    }
}

fn parse_cache(spec: &str) -> Result<CacheImage> {
    let Some((id, path)) = spec.split_once('=') else {
        bail!("cache image must be <target_id>=<file>, got '{spec}'");
    };
    let target_id = id
        .parse()
        .with_context(|| format!("invalid cache target id '{id}'"))?;
    let data = std::fs::read(path).with_context(|| format!("reading {path}"))?;
    Ok(CacheImage { target_id, data })
}

/// Resolves a resource URI to a file of the same name under `root`.
struct DirectoryProvider {
    root: PathBuf,
}

impl ResourceProvider for DirectoryProvider {
    fn provide(&self, uri: &str) -> Result<Vec<u8>> {
        let name = uri.rsplit(['/', ':']).next().unwrap_or(uri);
        if name.is_empty() {
            bail!("resource URI '{uri}' has no file name");
        }
        let path = self.root.join(name);
        info!(uri, path = %path.display(), "Providing resource");
        std::fs::read(&path).with_context(|| format!("reading {}", path.display()))
    }
}

struct DownloadSink {
    done: Sender<Result<Vec<u8>, Error>>,
}

impl TransferCallback for DownloadSink {
    fn on_failed(&mut self, error: Error) {
        let _ = self.done.send(Err(error));
    }

    fn on_canceled(&mut self) {
        let _ = self.done.send(Err(Error::InvalidDeviceState("download canceled".into())));
    }

    fn on_downloaded(&mut self, data: Vec<u8>) {
        let _ = self.done.send(Ok(data));
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}
