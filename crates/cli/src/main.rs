use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use kube::CustomResourceExt;
use protection_core::{FunctionRunner, RunFunctionRequest, RunFunctionResponse, Severity};
use protection_function::{ClusterUsage, DeletionProtection, FunctionConfig, Usage};
use tokio::io::AsyncReadExt;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "protectionctl", version, about = "Deletion protection function driver")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Json)]
    output: Output,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json, Yaml }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the function once against a captured request
    Run {
        /// RunFunctionRequest as JSON or YAML; "-" reads stdin
        #[arg(short = 'r', long = "request", default_value = "-")]
        request: String,
        /// Response TTL in seconds (overrides PROTECTION_FN_TTL_SECS)
        #[arg(long = "ttl-secs")]
        ttl_secs: Option<u64>,
        /// Only protect composites labelled protection.fn.crossplane.io/enabled=true
        #[arg(long = "require-enabled-label", action = ArgAction::SetTrue)]
        require_enabled_label: bool,
    },
    /// Print the Usage and ClusterUsage CustomResourceDefinitions
    Crds,
}

fn init_tracing() {
    let env = std::env::var("PROTECTION_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    // stdout carries the response
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

async fn read_request(path: &str) -> Result<RunFunctionRequest> {
    let text = if path == "-" {
        let mut buf = String::new();
        tokio::io::stdin().read_to_string(&mut buf).await.context("reading request from stdin")?;
        buf
    } else {
        tokio::fs::read_to_string(path).await.with_context(|| format!("reading request from {}", path))?
    };
    parse_request(&text)
}

fn parse_request(text: &str) -> Result<RunFunctionRequest> {
    if text.trim_start().starts_with('{') {
        serde_json::from_str(text).context("parsing JSON request")
    } else {
        serde_yaml::from_str(text).context("parsing YAML request")
    }
}

/// Apply command-line overrides on top of the environment configuration.
fn run_config(mut cfg: FunctionConfig, ttl_secs: Option<u64>, require_enabled_label: bool) -> FunctionConfig {
    if let Some(secs) = ttl_secs {
        cfg.response_ttl = Duration::from_secs(secs);
    }
    cfg.require_enabled_label |= require_enabled_label;
    cfg
}

/// Run the function once. The flag is set when the response carries a fatal
/// result; the caller turns it into a non-zero exit.
async fn run_cmd(request: &str, cfg: FunctionConfig) -> Result<(RunFunctionResponse, bool)> {
    info!(request = %request, ttl = ?cfg.response_ttl, require_enabled = cfg.require_enabled_label, "run invoked");
    let req = read_request(request).await?;
    let runner: Arc<dyn FunctionRunner> = Arc::new(DeletionProtection::new(cfg));
    let rsp = runner.run_function(req).await?;
    let fatal = rsp.is_fatal();
    Ok((rsp, fatal))
}

fn print_response(rsp: &RunFunctionResponse, output: Output) -> Result<()> {
    match output {
        Output::Json => println!("{}", serde_json::to_string_pretty(rsp)?),
        Output::Yaml => print!("{}", serde_yaml::to_string(rsp)?),
        Output::Human => {
            println!("tag: {}  ttl: {}", if rsp.meta.tag.is_empty() { "-" } else { rsp.meta.tag.as_str() }, rsp.meta.ttl);
            for r in &rsp.results {
                let sev = match r.severity {
                    Severity::Fatal => "FATAL",
                    Severity::Warning => "WARN",
                    Severity::Normal => "INFO",
                };
                println!("{:<6} {}", sev, r.message);
            }
            if let Some(desired) = &rsp.desired {
                println!("{:<32} {:<14} {}", "DESIRED", "KIND", "NAME");
                for (key, env) in &desired.resources {
                    let kind = env.resource.get("kind").and_then(|v| v.as_str()).unwrap_or("-");
                    let name = env
                        .resource
                        .get("metadata")
                        .and_then(|m| m.get("name"))
                        .and_then(|v| v.as_str())
                        .unwrap_or("-");
                    println!("{:<32} {:<14} {}", key, kind, name);
                }
            }
            for c in &rsp.conditions {
                println!("condition {} {:?} ({})", c.kind, c.status, c.reason);
            }
        }
    }
    Ok(())
}

fn print_crds(output: Output) -> Result<()> {
    let crds = [Usage::crd(), ClusterUsage::crd()];
    match output {
        Output::Json => println!("{}", serde_json::to_string_pretty(&crds)?),
        Output::Yaml | Output::Human => {
            for (i, crd) in crds.iter().enumerate() {
                if i > 0 { println!("---"); }
                print!("{}", serde_yaml::to_string(crd)?);
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { request, ttl_secs, require_enabled_label } => {
            let cfg = run_config(FunctionConfig::from_env(), ttl_secs, require_enabled_label);
            let (rsp, fatal) = run_cmd(&request, cfg).await?;
            print_response(&rsp, cli.output)?;
            if fatal {
                error!("function returned a fatal result");
                std::process::exit(1);
            }
        }
        Commands::Crds => {
            info!("crds invoked");
            print_crds(cli.output)?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_json_and_yaml_requests() {
        let j = r#"{"meta":{"tag":"t"},"observed":{"composite":{"resource":{"kind":"XApp","metadata":{"name":"a"}}}}}"#;
        assert_eq!(parse_request(j).unwrap().meta.tag, "t");
        let y = "meta:\n  tag: t\nobserved:\n  composite:\n    resource:\n      kind: XApp\n      metadata:\n        name: a\n";
        assert_eq!(parse_request(y).unwrap().observed_composite().unwrap().name(), "a");
    }

    #[test]
    fn parse_errors_carry_context() {
        let e = parse_request("{ not json").unwrap_err();
        assert!(format!("{:#}", e).contains("parsing JSON request"));
    }

    fn write_request(file: &str, body: &str) -> String {
        let path = std::env::temp_dir().join(format!("protectionctl-{}-{}", std::process::id(), file));
        std::fs::write(&path, body).unwrap();
        path.to_string_lossy().into_owned()
    }

    #[tokio::test]
    async fn reads_request_from_file() {
        let path = write_request("read.yaml", "meta:\n  tag: from-file\n");
        let req = read_request(&path).await.unwrap();
        assert_eq!(req.meta.tag, "from-file");
        let _ = std::fs::remove_file(&path);

        let e = read_request("/nonexistent/protectionctl/request.json").await.unwrap_err();
        assert!(format!("{:#}", e).contains("reading request from /nonexistent/protectionctl/request.json"));
    }

    #[tokio::test]
    async fn fatal_response_sets_failure_flag() {
        let path = write_request("fatal.json", r#"{"meta":{"tag":"t"},"desired":{"resources":{}}}"#);
        let (rsp, fatal) = run_cmd(&path, FunctionConfig::default()).await.unwrap();
        let _ = std::fs::remove_file(&path);
        assert!(fatal);
        assert!(rsp.desired.is_none());
        assert!(rsp.results[0].message.starts_with("cannot get primary resource"));
    }

    #[tokio::test]
    async fn successful_response_clears_failure_flag() {
        let path = write_request("ok.json", r#"{"meta":{"tag":"t"},"observed":{"composite":{"resource":{"kind":"XApp","metadata":{"name":"a"}}}}}"#);
        let (rsp, fatal) = run_cmd(&path, run_config(FunctionConfig::default(), Some(5), false)).await.unwrap();
        let _ = std::fs::remove_file(&path);
        assert!(!fatal);
        assert_eq!(rsp.meta.ttl, "5s");
    }

    #[test]
    fn flags_override_environment() {
        use protection_function::config::{ENV_REQUIRE_ENABLED, ENV_TTL_SECS};
        let base = FunctionConfig::from_lookup(|key| match key {
            k if k == ENV_TTL_SECS => Some("300".to_string()),
            k if k == ENV_REQUIRE_ENABLED => Some("false".to_string()),
            _ => None,
        });
        assert_eq!(base.response_ttl, Duration::from_secs(300));

        let kept = run_config(base.clone(), None, false);
        assert_eq!(kept, base);

        let cfg = run_config(base, Some(30), true);
        assert_eq!(cfg.response_ttl, Duration::from_secs(30));
        assert!(cfg.require_enabled_label);
    }

    #[test]
    fn crds_render() {
        let yaml = serde_yaml::to_string(&Usage::crd()).unwrap();
        assert!(yaml.contains("usages.protection.crossplane.io"));
        assert!(yaml.contains("scope: Namespaced"));
        let yaml = serde_yaml::to_string(&ClusterUsage::crd()).unwrap();
        assert!(yaml.contains("clusterusages.protection.crossplane.io"));
        assert!(yaml.contains("scope: Cluster"));
    }
}
