use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use prozess::config::EngineConfig;
use prozess::context::EngineContext;
use prozess::integrations::HttpFifthIndustry;
use prozess::management::Management;
use prozess::model::ProcessModel;
use prozess::recovery::{CalledInstancePolicy, RecoveryOptions};
use prozess::storage::RedisStorage;
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the engine configuration YAML
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Deploy a process model and run one instance until it ends
    Run {
        /// Path to the process model file (JSON, or YAML by extension)
        #[arg(long, short)]
        file: PathBuf,

        /// Version to deploy the model as
        #[arg(long, default_value_t = 1)]
        version: u64,

        /// Initial variables (key=value)
        #[arg(long, short = 'D', value_parser = parse_key_val)]
        vars: Vec<(String, serde_json::Value)>,
    },

    /// Restore instances the last run left marked as executing
    Recover {
        /// Interrupt restored called instances instead of pausing them
        #[arg(long)]
        error_called: bool,
    },
}

fn parse_key_val(s: &str) -> Result<(String, serde_json::Value), String> {
    let pos = s
        .find('=')
        .ok_or_else(|| format!("invalid KEY=value: no `=` found in `{}`", s))?;
    let key = s[..pos].to_string();
    let val_str = &s[pos + 1..];
    // Try parsing as JSON, otherwise treat as string
    let val = serde_json::from_str(val_str)
        .unwrap_or_else(|_| serde_json::Value::String(val_str.to_string()));
    Ok((key, val))
}

fn load_config(path: Option<&PathBuf>) -> Result<EngineConfig> {
    match path {
        Some(path) => EngineConfig::from_yaml_file(path),
        None => Ok(EngineConfig::default()),
    }
}

fn build_context(config: EngineConfig) -> Result<Arc<EngineContext>> {
    let redis_url = config.redis_url.clone();
    let fifth_industry = config.fifth_industry.clone();
    let mut ctx = EngineContext::new(config);
    if let Some(url) = redis_url {
        ctx = ctx.with_storage(Arc::new(RedisStorage::new(&url)?));
    }
    if let Some(fifth) = fifth_industry {
        ctx = ctx.with_fifth_industry(Arc::new(HttpFifthIndustry::new(fifth)));
    }
    Ok(Arc::new(ctx))
}

fn load_model(path: &PathBuf) -> Result<ProcessModel> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("failed to read model file {}", path.display()))?;
    let yaml = matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml") | Some("yml")
    );
    if yaml {
        serde_yaml::from_str(&text)
            .with_context(|| format!("failed to parse model file {}", path.display()))
    } else {
        ProcessModel::parse(&text)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();
    let config = load_config(cli.config.as_ref())?;
    let has_redis = config.redis_url.is_some();
    let ctx = build_context(config)?;
    let management = Management::new(ctx.clone());

    match cli.command {
        Commands::Run {
            file,
            version,
            vars,
        } => {
            let model = load_model(&file)?;
            let definition_id = model.id.clone();
            ctx.storage
                .save_process_version(&definition_id, version, &model.to_text()?)
                .await?;
            info!("deployed {} version {}", definition_id, version);

            let (done_tx, done_rx) = tokio::sync::oneshot::channel();
            let done_tx = Mutex::new(Some(done_tx));
            let handlers = prozess::engine::InstanceEventHandlers {
                on_ended: Some(Box::new(move |snapshot| {
                    if let Some(tx) = done_tx.lock().ok().and_then(|mut held| held.take()) {
                        let _ = tx.send(snapshot.clone());
                    }
                })),
                ..Default::default()
            };

            let initial_vars: HashMap<_, _> = vars.into_iter().collect();
            let started = management
                .create_instance(&definition_id, version, initial_vars, None, handlers, None)
                .await?;
            let Some(instance_id) = started else {
                bail!("this machine refused the instance (kill switch or start constraints)");
            };
            info!("instance {} started", instance_id);

            let snapshot = done_rx
                .await
                .context("engine went away before the instance ended")?;
            info!(
                "instance {} ended with state {:?}",
                instance_id, snapshot.instance_state
            );
            println!(
                "{}",
                serde_json::to_string_pretty(&snapshot.variable_values())?
            );
        }

        Commands::Recover { error_called } => {
            if !has_redis {
                warn!("no redis storage configured, the archive to recover from is empty");
            }
            let options = RecoveryOptions {
                called_instance_policy: if error_called {
                    CalledInstancePolicy::ErrorCalled
                } else {
                    CalledInstancePolicy::PauseCalled
                },
            };
            let restored = management.restore_interrupted_instances(&options).await?;
            if restored.is_empty() {
                info!("no interrupted instances in the archive");
                return Ok(());
            }
            for instance_id in &restored {
                info!("restored instance {}", instance_id);
            }
            info!("{} instance(s) running, ctrl-c to stop", restored.len());
            tokio::signal::ctrl_c().await?;
        }
    }

    Ok(())
}
