//! infer-client - command line client for KServe v2 inference servers

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use infer_client::{
    ClientConfig, DataType, FuturesModelClient, InferInputs, ModelClient, ModelConfig, Tensor,
    TensorSet,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::{Map, Value, json};
use std::path::PathBuf;
use std::time::Instant;

#[derive(Parser, Debug)]
#[command(name = "infer-client")]
#[command(about = "Client for KServe v2 inference servers", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Server url, e.g. grpc://localhost:8001
    #[arg(long)]
    url: Option<String>,

    /// Model name
    #[arg(short, long)]
    model: Option<String>,

    /// Model version (latest when omitted)
    #[arg(long = "model-version")]
    model_version: Option<String>,

    /// Seconds to wait for the model to become ready
    #[arg(long)]
    init_timeout: Option<f64>,

    /// Seconds allowed for a single inference call
    #[arg(long)]
    inference_timeout: Option<f64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log format (json or pretty)
    #[arg(long, default_value = "json")]
    log_format: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Check server liveness (single round trip)
    Live,
    /// Check server readiness (single round trip)
    Ready,
    /// Wait until the model is ready
    Wait,
    /// Print the model configuration as JSON
    Config,
    /// Run inference on JSON encoded tensors
    ///
    /// Inputs map tensor names to {"datatype", "shape", "data"} objects.
    Infer {
        /// Inline JSON or @path to a JSON file
        #[arg(short, long)]
        inputs: String,

        /// Inputs already carry the batch axis
        #[arg(long)]
        batch: bool,
    },
    /// Send random int64 sequences through the futures client
    Stress {
        #[arg(short = 'n', long, default_value_t = 1000)]
        requests: usize,

        /// Concurrent transport calls
        #[arg(long)]
        max_workers: Option<usize>,

        #[arg(long, default_value_t = 42)]
        seed: u64,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    match cli.log_format.as_str() {
        "pretty" => {
            tracing_subscriber::fmt()
                .with_env_filter(&cli.log_level)
                .init();
        }
        _ => {
            tracing_subscriber::fmt()
                .with_env_filter(&cli.log_level)
                .json()
                .init();
        }
    }

    // Load configuration
    let mut config = ClientConfig::load(cli.config.clone())?;

    // CLI overrides
    if let Some(url) = &cli.url {
        config.url = url.clone();
    }
    if let Some(model) = &cli.model {
        config.model_name = model.clone();
    }
    if let Some(version) = &cli.model_version {
        config.model_version = Some(version.clone());
    }
    if let Some(timeout) = cli.init_timeout {
        config.init_timeout_s = timeout;
    }
    if let Some(timeout) = cli.inference_timeout {
        config.inference_timeout_s = timeout;
    }

    tracing::debug!(
        url = %config.url,
        model = %config.model_name,
        version = ?config.model_version,
        "Configuration loaded"
    );

    match cli.command {
        Command::Stress {
            requests,
            max_workers,
            seed,
        } => {
            if let Some(max_workers) = max_workers {
                config.max_workers = max_workers;
            }
            config.validate()?;
            stress(&config, requests, seed)
        }
        command => {
            let runtime = tokio::runtime::Runtime::new().context("Failed to start runtime")?;
            runtime.block_on(run(command, config))
        }
    }
}

async fn run(command: Command, config: ClientConfig) -> Result<()> {
    match command {
        Command::Live | Command::Ready => {
            // Server probes do not need a model
            let connection = infer_client::Connection::open(
                &config.url,
                config.options().connection_timeout,
            )?;
            let ok = if matches!(command, Command::Live) {
                connection.is_server_live().await?
            } else {
                connection.is_server_ready().await?
            };
            connection.close();
            println!("{}", ok);
            if !ok {
                std::process::exit(1);
            }
        }
        Command::Wait => {
            config.validate()?;
            let client = ModelClient::from_config(&config).await?;
            let timeout = config.options().init_timeout;
            let model_config = client.wait_for_model(timeout).await?;
            tracing::info!(model = %client.model(), "Model is ready");
            println!("{}", model_config.name);
        }
        Command::Config => {
            config.validate()?;
            let client = ModelClient::from_config(&config).await?;
            let model_config = client.model_config().await?;
            println!("{}", serde_json::to_string_pretty(&config_json(&model_config))?);
        }
        Command::Infer { inputs, batch } => {
            config.validate()?;
            let tensors = parse_tensors(&read_inputs(&inputs)?)?;
            let client = ModelClient::from_config(&config).await?;
            let inputs = InferInputs::from(tensors);
            let outputs = if batch {
                client.infer_batch(inputs).await?
            } else {
                client.infer_sample(inputs).await?
            };
            println!("{}", serde_json::to_string_pretty(&tensors_json(&outputs)?)?);
        }
        Command::Stress { .. } => anyhow::bail!("stress runs on the futures client"),
    }
    Ok(())
}

/// Submit `requests` random sequences, waiting for the first completion
/// whenever more than `max_workers` are outstanding.
fn stress(config: &ClientConfig, requests: usize, seed: u64) -> Result<()> {
    let client = FuturesModelClient::from_config(config)?;
    let model_config = client
        .wait_for_model(config.options().init_timeout)
        .wait()
        .context("Model did not become ready")?;
    let inputs = SequenceInputs::for_model(&model_config)?;

    let mut rng = StdRng::seed_from_u64(seed);
    let mut pending = Vec::new();
    let mut completed = 0usize;
    let mut failed = 0usize;
    let started = Instant::now();

    let mut record = |result: infer_client::ClientResult<TensorSet>| match result {
        Ok(_) => completed += 1,
        Err(e) => {
            failed += 1;
            tracing::warn!(error = %e, "Request failed");
        }
    };

    for _ in 0..requests {
        if pending.len() > client.max_workers() {
            let (result, _, rest) = client.wait_any(pending);
            record(result);
            pending = rest;
        }

        pending.push(client.infer_sample(inputs.sample(&mut rng)));
    }

    for request in pending {
        record(request.wait());
    }

    let elapsed = started.elapsed();
    tracing::info!(
        completed = completed,
        failed = failed,
        elapsed_ms = elapsed.as_millis() as u64,
        requests_per_sec = requests as f64 / elapsed.as_secs_f64().max(f64::EPSILON),
        "Stress run finished"
    );
    client.close();

    if failed > 0 {
        anyhow::bail!("{} of {} requests failed", failed, requests);
    }
    Ok(())
}

const VOCABULARY_SIZE: i64 = 30_522;
const MIN_SEQUENCE_LENGTH: usize = 20;
const MAX_SEQUENCE_LENGTH: usize = 128;

/// Required inputs of a sequence model, split into token ids and masks
#[derive(Debug, Default, PartialEq)]
struct SequenceInputs {
    ids: Vec<String>,
    masks: Vec<String>,
}

impl SequenceInputs {
    fn for_model(config: &ModelConfig) -> Result<Self> {
        let mut inputs = Self::default();
        for spec in config.inputs.iter().filter(|spec| !spec.optional) {
            if spec.dtype != DataType::Int64 {
                anyhow::bail!(
                    "Stress requests fill INT64 sequence inputs only, but input {} is {}",
                    spec.name,
                    spec.dtype
                );
            }
            if spec.name.contains("mask") {
                inputs.masks.push(spec.name.clone());
            } else {
                inputs.ids.push(spec.name.clone());
            }
        }
        if inputs.ids.is_empty() && inputs.masks.is_empty() {
            anyhow::bail!("Model {} declares no required inputs", config.name);
        }
        Ok(inputs)
    }

    /// One sequence of random length; every input shares that length
    fn sample(&self, rng: &mut StdRng) -> TensorSet {
        let length = rng.gen_range(MIN_SEQUENCE_LENGTH..=MAX_SEQUENCE_LENGTH);
        let mut tensors = TensorSet::new();
        for name in &self.ids {
            let ids: Vec<i64> = (0..length).map(|_| rng.gen_range(1..VOCABULARY_SIZE)).collect();
            tensors.insert(name.clone(), Tensor::from_vec(ids));
        }
        for name in &self.masks {
            tensors.insert(name.clone(), Tensor::from_vec(vec![1i64; length]));
        }
        tensors
    }
}

fn read_inputs(arg: &str) -> Result<Value> {
    let text = match arg.strip_prefix('@') {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read inputs file: {}", path))?,
        None => arg.to_string(),
    };
    serde_json::from_str(&text).context("Inputs are not valid JSON")
}

fn parse_tensors(value: &Value) -> Result<TensorSet> {
    let object = value
        .as_object()
        .context("Inputs must be a JSON object keyed by tensor name")?;

    let mut tensors = TensorSet::new();
    for (name, spec) in object {
        let datatype = spec
            .get("datatype")
            .and_then(Value::as_str)
            .with_context(|| format!("Input {} has no datatype", name))?;
        let shape: Vec<usize> = serde_json::from_value(spec.get("shape").cloned().unwrap_or(Value::Null))
            .with_context(|| format!("Input {} has an invalid shape", name))?;
        let data = spec
            .get("data")
            .with_context(|| format!("Input {} has no data", name))?;
        let tensor = Tensor::from_json(DataType::from_wire_name(datatype)?, shape, data)?;
        tensors.insert(name.clone(), tensor);
    }
    Ok(tensors)
}

fn tensors_json(tensors: &TensorSet) -> Result<Value> {
    let mut out = Map::new();
    for (name, tensor) in tensors.iter() {
        out.insert(
            name.to_string(),
            json!({
                "datatype": tensor.dtype().wire_name(),
                "shape": tensor.shape(),
                "data": tensor.to_json()?,
            }),
        );
    }
    Ok(Value::Object(out))
}

fn config_json(config: &ModelConfig) -> Value {
    let specs = |specs: &[infer_client::TensorSpec]| -> Vec<Value> {
        specs
            .iter()
            .map(|spec| {
                json!({
                    "name": spec.name,
                    "datatype": spec.dtype.wire_name(),
                    "shape": spec.shape,
                    "optional": spec.optional,
                })
            })
            .collect()
    };
    json!({
        "name": config.name,
        "platform": config.platform,
        "backend": config.backend,
        "max_batch_size": config.max_batch_size.unwrap_or(0),
        "inputs": specs(&config.inputs),
        "outputs": specs(&config.outputs),
        "dynamic_batching": config.dynamic_batcher.as_ref().map(|batcher| json!({
            "preferred_batch_size": batcher.preferred_batch_sizes,
            "max_queue_delay_microseconds": batcher.max_queue_delay_microseconds,
            "preserve_ordering": batcher.preserve_ordering,
        })),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use infer_client::TensorSpec;

    fn bert() -> ModelConfig {
        ModelConfig::new("distilbert", 16)
            .with_input(TensorSpec::new("input_ids", DataType::Int64, vec![-1]))
            .with_input(TensorSpec::new("attention_mask", DataType::Int64, vec![-1]))
            .with_output(TensorSpec::new("logits", DataType::Fp32, vec![-1, 2]))
    }

    #[test]
    fn test_stress_sample_fills_every_input() {
        let config = bert();
        let inputs = SequenceInputs::for_model(&config).unwrap();
        let mut rng = StdRng::seed_from_u64(42);

        for _ in 0..50 {
            let tensors = inputs.sample(&mut rng);
            let ids = tensors.get("input_ids").unwrap().to_vec::<i64>().unwrap();
            let mask = tensors.get("attention_mask").unwrap().to_vec::<i64>().unwrap();

            assert!((MIN_SEQUENCE_LENGTH..=MAX_SEQUENCE_LENGTH).contains(&ids.len()));
            assert_eq!(ids.len(), mask.len());
            assert!(ids.iter().all(|id| (1..VOCABULARY_SIZE).contains(id)));
            assert!(mask.iter().all(|&m| m == 1));

            // Passes the same checks the client runs before sending
            config.check_inputs(tensors.clone(), false).unwrap();
        }
    }

    #[test]
    fn test_stress_rejects_unfillable_inputs() {
        let config = bert().with_input(TensorSpec::new("pixels", DataType::Fp32, vec![3]));
        let err = SequenceInputs::for_model(&config).unwrap_err();
        assert!(err.to_string().contains("pixels"));
    }
}
