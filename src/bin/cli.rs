//! devbench CLI - headless operator entry point
//!
//! Port listing, frame encode/decode, device probing and calls, operation
//! search, and dry runs against a virtual device.

use anyhow::Context;
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use devbench_core::cli::{decoded_json, frame_json, hex_format, init_tracing, CliResult, OutputFormat};
use devbench_core::config::AppConfig;
use devbench_core::core::device::{Args, CallOptions, CapabilityRegistry, Device, OperationCatalog};
use devbench_core::core::logger::{self, TrafficLog};
use devbench_core::core::protocol::{encode_frame, DiagDecoder, FrameCodec, FramePayload};
use devbench_core::core::scheduler::{Scheduler, SchedulerEvent};
use devbench_core::core::simulator::{self, SimulatorScript};
use devbench_core::core::testing::{CaseContext, CaseSpec, MemorySink, TestRegistry, TestSet, TestSetDef};
use devbench_core::core::transport::{list_ports, Reply, SerialConfig, Transport};

/// devbench CLI
#[derive(Parser, Debug)]
#[command(name = "devbench", version, about = "Serial test bench for framed embedded devices", long_about = None)]
struct Cli {
    /// Configuration file (TOML, YAML or JSON)
    #[arg(short, long, env = "DEVBENCH_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Output format
    #[arg(short, long, value_enum, default_value_t = OutputFormat::Text, global = true)]
    format: OutputFormat,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List available serial ports
    Ports,

    /// Decode hex bytes into frames
    Decode {
        /// Bytes as hex; whitespace is ignored
        hex: String,
    },

    /// Encode a downlink frame
    Encode {
        /// Model id as hex
        #[arg(short, long)]
        model: String,
        /// Opcode as hex
        #[arg(short, long)]
        opcode: String,
        /// Payload as hex
        #[arg(default_value = "")]
        payload: String,
    },

    /// Open a port and run the bootstrap handshake
    Probe {
        /// Serial port name (e.g., COM3, /dev/ttyUSB0)
        #[arg(short, long)]
        port: String,
        /// Baud rate (defaults to the configured one)
        #[arg(short, long)]
        baud: Option<u32>,
    },

    /// Call an operation on a device
    Call {
        /// Serial port name
        #[arg(short, long)]
        port: String,
        /// Baud rate (defaults to the configured one)
        #[arg(short, long)]
        baud: Option<u32>,
        /// Operation name or alias
        operation: String,
        /// Arguments as a JSON object
        #[arg(short, long, default_value = "{}")]
        args: String,
        /// Response timeout in milliseconds
        #[arg(short, long)]
        timeout: Option<u64>,
        /// Frames to collect per header; -1 collects until the timeout
        #[arg(short, long, default_value_t = 1, allow_hyphen_values = true)]
        num: i32,
        /// Operation catalog (overrides the configured one)
        #[arg(long)]
        catalog: Option<PathBuf>,
    },

    /// Fuzzy search over catalog operations
    Search {
        /// Search text
        query: String,
        /// Operation catalog (overrides the configured one)
        #[arg(long)]
        catalog: Option<PathBuf>,
    },

    /// Run against a virtual device
    Simulate {
        /// Simulator script (YAML or JSON); an acknowledging device otherwise
        #[arg(short, long)]
        script: Option<PathBuf>,
        /// Operation catalog (overrides the configured one)
        #[arg(long)]
        catalog: Option<PathBuf>,
        /// Operation to call after the handshake
        operation: Option<String>,
        /// Arguments as a JSON object
        #[arg(short, long, default_value = "{}")]
        args: String,
        /// Repeat the call as a scheduled test run
        #[arg(long)]
        run: bool,
    },

    /// Show exit codes
    ExitCodes,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match load_config(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            let result = CliResult::from_anyhow(&e);
            eprintln!("error: {:#}", e);
            return result.to_exit_code();
        }
    };

    let log_dir = config
        .logging
        .file
        .then(|| config.paths.log_dir.clone())
        .flatten();
    let _guard = init_tracing(&config.logging.level, cli.verbose, log_dir.as_deref());
    tracing::debug!("Starting devbench v{}", env!("CARGO_PKG_VERSION"));

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("error: {}", e);
            return CliResult::from(e).to_exit_code();
        }
    };

    match runtime.block_on(dispatch(&cli, &config)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            let result = CliResult::from_anyhow(&e);
            tracing::debug!(code = result.code(), "Exiting with error");
            eprintln!("error: {:#}", e);
            result.to_exit_code()
        }
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<AppConfig> {
    Ok(match path {
        Some(path) => AppConfig::load_from(path).with_context(|| format!("loading {}", path.display()))?,
        None => AppConfig::load()?,
    })
}

async fn dispatch(cli: &Cli, config: &AppConfig) -> anyhow::Result<()> {
    match &cli.command {
        Commands::Ports => ports(cli),
        Commands::Decode { hex: input } => decode(cli, config, input),
        Commands::Encode { model, opcode, payload } => encode(cli, config, model, opcode, payload),
        Commands::Probe { port, baud } => probe(cli, config, port, *baud).await,
        Commands::Call {
            port,
            baud,
            operation,
            args,
            timeout,
            num,
            catalog,
        } => {
            let options = call_options(*timeout, *num);
            call(cli, config, port, *baud, catalog.as_deref(), operation, args, options).await
        }
        Commands::Search { query, catalog } => search(cli, config, catalog.as_deref(), query),
        Commands::Simulate {
            script,
            catalog,
            operation,
            args,
            run,
        } => simulate(cli, config, script.as_deref(), catalog.as_deref(), operation.as_deref(), args, *run).await,
        Commands::ExitCodes => {
            devbench_core::cli::print_exit_codes();
            Ok(())
        }
    }
}

fn parse_hex(value: &str) -> anyhow::Result<Vec<u8>> {
    let cleaned: String = value.split_whitespace().collect();
    let cleaned = cleaned.trim_start_matches("0x");
    hex::decode(cleaned).with_context(|| format!("invalid hex '{}'", value))
}

fn parse_args(args: &str) -> anyhow::Result<Args> {
    serde_json::from_str(args).with_context(|| format!("invalid JSON arguments '{}'", args))
}

fn call_options(timeout: Option<u64>, num: i32) -> CallOptions {
    let options = CallOptions::default().num(num);
    match timeout {
        Some(ms) => options.timeout(Duration::from_millis(ms)),
        None => options,
    }
}

fn codec(config: &AppConfig) -> anyhow::Result<FrameCodec> {
    let codec = FrameCodec::new(config.protocol());
    Ok(match &config.paths.diag_table {
        Some(path) => codec.with_diag(Arc::new(DiagDecoder::from_file(path)?)),
        None => codec,
    })
}

fn registry(config: &AppConfig, catalog: Option<&Path>) -> anyhow::Result<CapabilityRegistry> {
    let mut registry = CapabilityRegistry::with_builtins(config.protocol());
    if let Some(path) = catalog.or(config.device.catalog.as_deref()) {
        let count = OperationCatalog::load(path)?.install(&mut registry)?;
        tracing::info!(path = %path.display(), operations = count, "Catalog installed");
    }
    Ok(registry)
}

fn serial_config(config: &AppConfig, port: &str, baud: Option<u32>) -> SerialConfig {
    let mut serial = config.serial.for_port(port);
    if let Some(baud) = baud {
        serial.baud_rate = baud;
    }
    serial
}

async fn connect(
    config: &AppConfig,
    serial: &SerialConfig,
    registry: CapabilityRegistry,
    traffic: TrafficLog,
) -> anyhow::Result<Device> {
    let transport = Transport::open_serial(serial, codec(config)?, traffic)?;
    let device = Device::connect(transport, registry, config.bootstrap_timeout()).await?;
    Ok(device.with_call_timeout(config.call_timeout()))
}

fn ports(cli: &Cli) -> anyhow::Result<()> {
    let ports = list_ports()?;
    match cli.format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&ports)?),
        OutputFormat::Text if ports.is_empty() => println!("No serial ports found."),
        OutputFormat::Text => ports.iter().for_each(|p| println!("{}", p)),
    }
    Ok(())
}

fn decode(cli: &Cli, config: &AppConfig, input: &str) -> anyhow::Result<()> {
    let bytes = parse_hex(input)?;
    let codec = codec(config)?;
    let (frames, rest) = codec.decode_stream(&bytes);

    match cli.format {
        OutputFormat::Json => {
            let value = json!({
                "frames": frames.iter().map(frame_json).collect::<Vec<_>>(),
                "remainder": hex::encode(rest),
            });
            println!("{}", serde_json::to_string_pretty(&value)?);
        }
        OutputFormat::Text => {
            for frame in &frames {
                println!(
                    "{:?} header={} payload={} checksum={}",
                    frame.kind,
                    hex_format(&frame.header),
                    match &frame.payload {
                        FramePayload::Binary(b) => hex_format(b),
                        FramePayload::Text(t) => t.clone(),
                    },
                    hex_format(&frame.checksum)
                );
            }
            println!("{} frame(s), remainder: {}", frames.len(), hex_format(rest));
        }
    }
    Ok(())
}

fn encode(cli: &Cli, config: &AppConfig, model: &str, opcode: &str, payload: &str) -> anyhow::Result<()> {
    let protocol = config.protocol();
    let header = protocol.downlink_header_for(&parse_hex(model)?, &parse_hex(opcode)?);
    let frame = encode_frame(&protocol, &header, &parse_hex(payload)?);
    match cli.format {
        OutputFormat::Json => println!("{}", json!({ "frame": hex::encode(&frame) })),
        OutputFormat::Text => println!("{}", hex_format(&frame)),
    }
    Ok(())
}

fn print_reply(cli: &Cli, operation: &str, reply: &Reply) -> anyhow::Result<()> {
    let values: Vec<serde_json::Value> = match reply {
        Reply::Single(value) => vec![decoded_json(value.as_ref())],
        Reply::Slots(slots) => slots.iter().map(|v| decoded_json(v.as_ref())).collect(),
        Reply::Collected(values) => values.iter().map(|v| decoded_json(Some(v))).collect(),
    };
    match cli.format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&json!({ "operation": operation, "reply": values }))?);
        }
        OutputFormat::Text => {
            if reply.is_absent() {
                println!("{}: no response", operation);
            }
            for value in values {
                println!("{}: {}", operation, value);
            }
        }
    }
    Ok(())
}

async fn probe(cli: &Cli, config: &AppConfig, port: &str, baud: Option<u32>) -> anyhow::Result<()> {
    let serial = serial_config(config, port, baud);
    let device = connect(config, &serial, registry(config, None)?, logger::shared()).await?;
    let info = device.info();
    match cli.format {
        OutputFormat::Json => println!("{}", json!({ "port": port, "info": decoded_json(info.as_ref()) })),
        OutputFormat::Text => println!(
            "{}: {}",
            port,
            info.map(|i| i.to_string()).unwrap_or_else(|| "no info".into())
        ),
    }
    device.close().await;
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn call(
    cli: &Cli,
    config: &AppConfig,
    port: &str,
    baud: Option<u32>,
    catalog: Option<&Path>,
    operation: &str,
    args: &str,
    options: CallOptions,
) -> anyhow::Result<()> {
    let args = parse_args(args)?;
    let serial = serial_config(config, port, baud);
    let device = connect(config, &serial, registry(config, catalog)?, logger::shared()).await?;

    let result = device.call(operation, &args, options).await;
    let diag = device.drain_diag_log();
    device.close().await;

    let reply = result?;
    print_reply(cli, operation, &reply)?;
    if !diag.is_empty() {
        eprintln!("{}", diag);
    }
    Ok(())
}

fn search(cli: &Cli, config: &AppConfig, catalog: Option<&Path>, query: &str) -> anyhow::Result<()> {
    let hits = registry(config, catalog)?.search(query);
    match cli.format {
        OutputFormat::Json => {
            let value: Vec<serde_json::Value> = hits
                .iter()
                .map(|hit| {
                    json!({
                        "name": hit.name,
                        "params": hit.params.iter().map(ToString::to_string).collect::<Vec<_>>(),
                        "doc": hit.doc,
                    })
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&value)?);
        }
        OutputFormat::Text => {
            for hit in hits {
                let params: Vec<String> = hit.params.iter().map(ToString::to_string).collect();
                println!("{}({})  {}", hit.name, params.join(", "), hit.doc);
            }
        }
    }
    Ok(())
}

/// Calls one operation per case and checks for a success status
struct SmokeSet {
    operation: String,
    args: Args,
}

#[async_trait]
impl TestSet for SmokeSet {
    async fn run(&mut self, _case_no: &str, ctx: &mut CaseContext) -> anyhow::Result<()> {
        let device = ctx.devices().get(0).cloned().context("no device attached")?;
        for _ in 0..ctx.circle().unwrap_or(1) {
            let reply = device.call(&self.operation, &self.args, CallOptions::default()).await?;
            let value = reply.into_single();
            if !ctx.check_status(value.as_ref(), &self.operation, None) {
                break;
            }
        }
        Ok(())
    }
}

async fn simulate(
    cli: &Cli,
    config: &AppConfig,
    script: Option<&Path>,
    catalog: Option<&Path>,
    operation: Option<&str>,
    args: &str,
    run: bool,
) -> anyhow::Result<()> {
    let protocol = config.protocol();
    let virtual_device = match script {
        Some(path) => SimulatorScript::load(path)?.build(protocol.clone())?,
        None => simulator::acknowledging_device("devbench-sim", protocol.clone()),
    };
    let traffic = logger::shared();
    let (transport, handle) = simulator::connect(virtual_device, codec(config)?, traffic.clone());
    let device = Device::connect(transport, registry(config, catalog)?, config.bootstrap_timeout())
        .await?
        .with_call_timeout(config.call_timeout());
    let info = device.info();
    println!(
        "{}: {}",
        handle.name(),
        info.map(|i| i.to_string()).unwrap_or_else(|| "no info".into())
    );

    match (operation, run) {
        (Some(operation), false) => {
            let reply = device.call(operation, &parse_args(args)?, CallOptions::default()).await?;
            print_reply(cli, operation, &reply)?;
            device.close().await;
        }
        (Some(operation), true) => {
            let (tx, mut rx) = mpsc::channel(64);
            let scheduler = Scheduler::new(config.scheduler_settings(), traffic).with_events(tx);
            scheduler.attach_device(device);
            let progress = tokio::spawn(async move {
                while let Some(event) = rx.recv().await {
                    match event {
                        SchedulerEvent::CaseStarted { set, no } => {
                            tracing::info!(%set, %no, "Case started");
                        }
                        SchedulerEvent::CaseCancelled { set, no } => {
                            tracing::warn!(%set, %no, "Case cancelled");
                        }
                        SchedulerEvent::RunFinished { .. } => break,
                        _ => {}
                    }
                }
            });

            let mut tests = TestRegistry::new();
            let smoke_operation = operation.to_string();
            let smoke_args = parse_args(args)?;
            tests.add(
                TestSetDef::new("Smoke", move |_| {
                    Box::new(SmokeSet {
                        operation: smoke_operation.clone(),
                        args: smoke_args.clone(),
                    })
                })
                .case(CaseSpec::new("TC_SMOKE_001").name(operation).repeatable()),
            )?;
            scheduler.load_tests(tests);

            let sink = MemorySink::new();
            scheduler.attach_sink(Box::new(sink.clone()));
            let summary = scheduler.run().await?;
            for row in sink.rows() {
                match cli.format {
                    OutputFormat::Json => println!("{}", serde_json::to_string(&row)?),
                    OutputFormat::Text => println!(
                        "{} {} {} {}",
                        row.time,
                        row.no,
                        row.result,
                        row.msg.as_deref().unwrap_or("")
                    ),
                }
            }
            println!(
                "{} invocation(s), {} blocked, logs in {}",
                summary.invocations,
                summary.blocked,
                summary.log_dir.display()
            );
            scheduler.close_devices().await;
            drop(scheduler);
            let _ = progress.await;
        }
        (None, _) => device.close().await,
    }

    handle.shutdown().await;
    Ok(())
}
