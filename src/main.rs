use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser};
use tracing_subscriber::EnvFilter;

use recon_pipeline::client::CredentialPool;
use recon_pipeline::config::PipelineConfig;
use recon_pipeline::passive::PassiveSource;
use recon_pipeline::pipeline::{PassiveOptions, Pipeline, PipelineReport, RunOptions};
use recon_pipeline::PipelineError;

/// Command-line arguments of the reconnaissance run.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "recon-pipeline",
    version,
    about = "Runs enumeration and scan tools against a domain and aggregates per-asset findings.",
    long_about = None
)]
struct Cli {
    /// Target domain (e.g. example.com).
    #[arg(short = 'd', long)]
    domain: String,

    /// Output directory for tool output and exports.
    #[arg(short = 'o', long)]
    output: Option<PathBuf>,

    /// Comma-separated enumeration tools (subfinder, amass, assetfinder, gobuster).
    #[arg(long = "enum-tools", value_delimiter = ',')]
    enum_tools: Option<Vec<String>>,

    /// TOML file overriding built-in tool commands, timeouts and providers.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Check live hosts for subdomain takeover with subjack.
    #[arg(long, default_value_t = false)]
    subtakeover: bool,

    /// Passive port scan provider.
    #[arg(long = "passive-scan")]
    passive_scan: Option<PassiveSource>,

    /// Max number of addresses looked up passively.
    #[arg(long = "passive-limit")]
    passive_limit: Option<usize>,

    /// Delay between passive API calls, in seconds.
    #[arg(long = "passive-delay")]
    passive_delay: Option<f64>,

    /// Comma-separated Shodan API keys.
    #[arg(long = "shodan-keys", env = "SHODAN_API_KEYS", hide_env_values = true)]
    shodan_keys: Option<String>,

    /// Comma-separated Censys API ids.
    #[arg(long = "censys-ids", env = "CENSYS_API_IDS", hide_env_values = true)]
    censys_ids: Option<String>,

    /// Comma-separated Censys API secrets.
    #[arg(long = "censys-secrets", env = "CENSYS_API_SECRETS", hide_env_values = true)]
    censys_secrets: Option<String>,

    /// Comma-separated chat backend keys.
    #[arg(long = "openai-keys", env = "OPENAI_API_KEY", hide_env_values = true)]
    openai_keys: Option<String>,

    /// Classify live hosts with the chat backend.
    #[arg(long, default_value_t = false)]
    fingerprint: bool,

    #[arg(long = "skip-nmap", default_value_t = false)]
    skip_nmap: bool,

    #[arg(long = "skip-nuclei", default_value_t = false)]
    skip_nuclei: bool,

    /// Skip classification even when --fingerprint is given.
    #[arg(long = "skip-ai", default_value_t = false)]
    skip_ai: bool,

    /// Ask the chat backend for exploitation advice on every stored asset.
    #[arg(long = "ai-agent", default_value_t = false)]
    ai_agent: bool,

    /// Max assets analysed concurrently.
    #[arg(long)]
    concurrency: Option<usize>,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace).
    #[arg(short = 'v', long = "verbose", action = ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match run(cli).await {
        Ok(()) => {}
        Err(e) => {
            eprintln!("Error: {e:#}");
            let code = e
                .downcast_ref::<PipelineError>()
                .map(PipelineError::exit_code)
                .unwrap_or(1);
            std::process::exit(code);
        }
    }
}

fn init_tracing(verbose: u8) {
    let filter = match verbose {
        0 => "warn,recon_pipeline=info",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .init();
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = match cli.config.as_deref() {
        Some(path) => PipelineConfig::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => PipelineConfig::default(),
    };
    if let Some(output) = &cli.output {
        config.output_dir = output.clone();
    }
    if let Some(tools) = &cli.enum_tools {
        config.enum_tools = tools.iter().map(|t| t.trim().to_string()).collect();
    }
    if let Some(n) = cli.concurrency {
        config.concurrency = n;
    }
    if let Some(limit) = cli.passive_limit {
        config.passive.limit = Some(limit);
    }
    if let Some(secs) = cli.passive_delay {
        let delay = Duration::try_from_secs_f64(secs)
            .map_err(|_| PipelineError::Config(format!("invalid --passive-delay {secs}")))?;
        config.passive.delay_ms = delay.as_millis() as u64;
    }

    let passive = cli.passive_scan.map(|source| {
        let credentials = match source {
            PassiveSource::Shodan => CredentialPool::from_keys(cli.shodan_keys.as_deref().unwrap_or("")),
            PassiveSource::Censys => CredentialPool::from_pairs(
                cli.censys_ids.as_deref().unwrap_or(""),
                cli.censys_secrets.as_deref().unwrap_or(""),
            ),
        };
        PassiveOptions { source, credentials }
    });

    let classify = cli.fingerprint && !cli.skip_ai;
    let llm_credentials = cli.openai_keys.as_deref().map(CredentialPool::from_keys);

    println!("recon-pipeline configuration:");
    println!("  domain       : {}", cli.domain);
    println!("  output       : {}", config.output_dir.display());
    println!("  database     : {}", config.db_path(&cli.domain).display());
    println!("  enum_tools   : {}", config.enum_tools.join(", "));
    println!("  concurrency  : {}", config.concurrency);
    println!(
        "  passive      : {}",
        passive
            .as_ref()
            .map(|p| format!("{} ({} credentials)", p.source.as_str(), p.credentials.len()))
            .unwrap_or_else(|| "<off>".to_string())
    );
    println!("  nuclei/nmap  : {}/{}", !cli.skip_nuclei, !cli.skip_nmap);
    println!("  classify     : {}", classify);
    println!("  advisor      : {}", cli.ai_agent);

    let options = RunOptions {
        domain: cli.domain.clone(),
        subtakeover: cli.subtakeover,
        passive,
        nuclei: !cli.skip_nuclei,
        nmap: !cli.skip_nmap,
        classify,
        advise: cli.ai_agent,
        llm_credentials,
    };

    let report = Pipeline::new(config, options).run().await?;
    print_summary(&cli.domain, &report);
    Ok(())
}

fn print_summary(domain: &str, report: &PipelineReport) {
    println!("\nScan complete for {domain}");
    println!("  hosts found  : {}", report.all_hosts);
    println!("  live hosts   : {}", report.live_hosts);
    if let Some(p) = &report.passive {
        println!(
            "  passive      : {} lookups, {} failed, {} ports saved -> {}",
            p.ips_queried,
            p.failures,
            p.ports_saved,
            p.csv_path.display()
        );
    }
    for (label, batch) in [
        ("deep scans", &report.deep_scan),
        ("classified", &report.classification),
        ("advised", &report.advisory),
    ] {
        if let Some(b) = batch {
            println!(
                "  {label:<12} : {} ok, {} skipped, {} failed",
                b.succeeded, b.skipped, b.failed
            );
        }
    }
    if let Some(path) = &report.graph_path {
        println!("  asset graph  : {}", path.display());
    }
}
