//! The tokenizer / ONNX model pair behind the chat, loaded once per process.
//!
//! Generation only needs two things from the outside world: a [`TextCodec`]
//! to move between text and token ids, and a [`LanguageModel`] that scores
//! the next token. [`ModelProvider`] owns the cached pair.

use anyhow::{anyhow, Context};
use ndarray::{ArrayD, CowArray};
use ort::{Environment, Session, SessionBuilder, Value};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokenizers::Tokenizer;
use tokio::sync::OnceCell;
use tracing::{error, info, warn};

use crate::error::{ChatError, Result};

/// Identifier of the model the chat ships with.
pub const DEFAULT_MODEL_ID: &str = "dialogpt-medium";

const TOKENIZER_FILE: &str = "tokenizer.json";
const MODEL_FILE: &str = "model.onnx";
const CONFIG_FILE: &str = "config.json";

/// Scores the token that follows each sequence of a batch.
pub trait LanguageModel: Send + Sync {
    /// One row of logits per sequence, for the position after its last token.
    /// Every sequence in a batch has the same length.
    fn next_token_logits(&self, sequences: &[Vec<u32>]) -> Result<Vec<Vec<f32>>>;

    /// Longest sequence the model accepts.
    fn context_window(&self) -> usize;
}

/// Translates between display text and token ids.
pub trait TextCodec: Send + Sync {
    fn encode(&self, text: &str) -> Result<Vec<u32>>;

    /// Decodes ids, dropping special tokens.
    fn decode(&self, ids: &[u32]) -> Result<String>;

    /// Marker closing every conversation turn.
    fn eos_token(&self) -> &str;

    fn eos_token_id(&self) -> u32;

    fn pad_token_id(&self) -> u32;
}

#[derive(Debug, Deserialize, Serialize)]
pub struct ModelConfig {
    #[serde(default = "default_eos_token_id")]
    pub eos_token_id: u32,
    #[serde(default = "default_bos_token_id")]
    pub bos_token_id: u32,
    #[serde(default = "default_max_position_embeddings", alias = "n_positions")]
    pub max_position_embeddings: usize,
    #[serde(default = "default_vocab_size")]
    pub vocab_size: usize,
}

fn default_eos_token_id() -> u32 { 50256 }
fn default_bos_token_id() -> u32 { 50256 }
fn default_max_position_embeddings() -> usize { 1024 }
fn default_vocab_size() -> usize { 50257 }

impl ModelConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let config_str = fs::read_to_string(path)
            .with_context(|| format!("Failed to load {}", path.display()))?;
        let config = serde_json::from_str(&config_str)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        Ok(config)
    }
}

/// A `tokenizers` tokenizer with its turn and padding markers resolved.
pub struct ChatTokenizer {
    inner: Tokenizer,
    eos_token: String,
    eos_token_id: u32,
    pad_token_id: u32,
}

impl ChatTokenizer {
    pub fn new(inner: Tokenizer, eos_token_id: u32) -> anyhow::Result<Self> {
        let eos_token = inner
            .id_to_token(eos_token_id)
            .ok_or_else(|| anyhow!("EOS token id {} is not in the vocabulary", eos_token_id))?;

        // GPT-2 style tokenizers ship without a padding token
        let pad_token_id = match inner.get_padding() {
            Some(padding) => padding.pad_id,
            None => {
                info!("No padding token defined, falling back to {}", eos_token);
                eos_token_id
            }
        };

        Ok(Self { inner, eos_token, eos_token_id, pad_token_id })
    }

    pub fn from_file(path: &Path, eos_token_id: u32) -> anyhow::Result<Self> {
        let inner = Tokenizer::from_file(path)
            .map_err(|e| anyhow!("Failed to load tokenizer: {}", e))?;
        Self::new(inner, eos_token_id)
    }
}

impl TextCodec for ChatTokenizer {
    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let encoding = self.inner.encode(text, false)?;
        Ok(encoding.get_ids().to_vec())
    }

    fn decode(&self, ids: &[u32]) -> Result<String> {
        Ok(self.inner.decode(ids, true)?)
    }

    fn eos_token(&self) -> &str {
        &self.eos_token
    }

    fn eos_token_id(&self) -> u32 {
        self.eos_token_id
    }

    fn pad_token_id(&self) -> u32 {
        self.pad_token_id
    }
}

/// A causal LM exported to ONNX, run without a KV cache.
pub struct OnnxModel {
    session: Session,
    input_names: Vec<String>,
    context_window: usize,
}

impl OnnxModel {
    pub fn from_file(
        environment: &Arc<Environment>,
        path: &Path,
        context_window: usize,
    ) -> anyhow::Result<Self> {
        let session = SessionBuilder::new(environment)?
            .with_model_from_file(path)
            .map_err(|e| anyhow!("Model loading failed: {}", e))?;
        let input_names: Vec<String> = session.inputs.iter().map(|i| i.name.clone()).collect();
        info!("ONNX graph inputs: {:?}", input_names);
        Ok(Self { session, input_names, context_window })
    }
}

impl LanguageModel for OnnxModel {
    fn next_token_logits(&self, sequences: &[Vec<u32>]) -> Result<Vec<Vec<f32>>> {
        let batch = sequences.len();
        let seq_len = sequences.first().map(Vec::len).unwrap_or(0);
        if batch == 0 || seq_len == 0 {
            return Err(ChatError::EmptyInput);
        }
        if sequences.iter().any(|s| s.len() != seq_len) {
            return Err(ChatError::Shape("sequences in a batch differ in length".to_string()));
        }

        let input_ids_data: Vec<i64> = sequences.iter().flatten().map(|&t| t as i64).collect();
        let input_ids = CowArray::from(ArrayD::from_shape_vec(vec![batch, seq_len], input_ids_data)?);

        let attention_mask_data = vec![1i64; batch * seq_len];
        let attention_mask =
            CowArray::from(ArrayD::from_shape_vec(vec![batch, seq_len], attention_mask_data)?);

        let position_ids_data: Vec<i64> = (0..batch).flat_map(|_| 0..seq_len as i64).collect();
        let position_ids =
            CowArray::from(ArrayD::from_shape_vec(vec![batch, seq_len], position_ids_data)?);

        let mut inputs = Vec::with_capacity(self.input_names.len());
        for name in &self.input_names {
            let array = match name.as_str() {
                "input_ids" => &input_ids,
                "attention_mask" => &attention_mask,
                "position_ids" => &position_ids,
                other => {
                    return Err(ChatError::Inference(format!("unsupported model input `{}`", other)))
                }
            };
            inputs.push(Value::from_array(self.session.allocator(), array)?);
        }

        let outputs = self.session.run(inputs)?;
        let logits = outputs
            .first()
            .ok_or_else(|| ChatError::Shape("model produced no outputs".to_string()))?
            .try_extract::<f32>()?;
        let logits_view = logits.view();

        let shape = logits_view.shape();
        if shape.len() != 3 || shape[0] != batch || shape[1] != seq_len {
            return Err(ChatError::Shape(format!(
                "expected [{}, {}, vocab], got {:?}",
                batch, seq_len, shape
            )));
        }

        let next_pos = seq_len - 1;
        Ok((0..batch)
            .map(|b| {
                logits_view
                    .slice(ndarray::s![b, next_pos, ..])
                    .iter()
                    .copied()
                    .collect()
            })
            .collect())
    }

    fn context_window(&self) -> usize {
        self.context_window
    }
}

/// A ready tokenizer / model pair. Cheap to clone.
#[derive(Clone)]
pub struct LoadedModel {
    pub tokenizer: Arc<dyn TextCodec>,
    pub model: Arc<dyn LanguageModel>,
}

type Loader = Arc<dyn Fn() -> anyhow::Result<LoadedModel> + Send + Sync>;

/// Loads the model on first use and keeps the outcome for the process
/// lifetime. A failed load stays failed until restart.
pub struct ModelProvider {
    id: String,
    loader: Loader,
    loaded: OnceCell<std::result::Result<LoadedModel, String>>,
}

impl ModelProvider {
    pub fn with_loader<F>(id: impl Into<String>, loader: F) -> Self
    where
        F: Fn() -> anyhow::Result<LoadedModel> + Send + Sync + 'static,
    {
        Self { id: id.into(), loader: Arc::new(loader), loaded: OnceCell::new() }
    }

    /// Provider for `<models_dir>/<id>/{tokenizer.json, model.onnx, config.json}`.
    pub fn onnx(models_dir: impl Into<PathBuf>, id: &str) -> Self {
        let model_dir = models_dir.into().join(id);
        let name = id.to_string();
        Self::with_loader(id, move || load_onnx(&name, &model_dir))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub async fn get(&self) -> Result<LoadedModel> {
        let loaded = self
            .loaded
            .get_or_init(|| async {
                let loader = Arc::clone(&self.loader);
                match tokio::task::spawn_blocking(move || loader()).await {
                    Ok(Ok(model)) => Ok(model),
                    Ok(Err(e)) => {
                        error!("Error loading model {}: {:#}", self.id, e);
                        Err(format!("{:#}", e))
                    }
                    Err(e) => {
                        error!("Model loader for {} panicked: {}", self.id, e);
                        Err(e.to_string())
                    }
                }
            })
            .await;
        loaded.clone().map_err(ChatError::ModelUnavailable)
    }

    pub fn is_ready(&self) -> bool {
        matches!(self.loaded.get(), Some(Ok(_)))
    }

    /// The load error, once a load has been attempted and failed.
    pub fn failure(&self) -> Option<&str> {
        match self.loaded.get() {
            Some(Err(e)) => Some(e.as_str()),
            _ => None,
        }
    }
}

fn load_onnx(id: &str, model_dir: &Path) -> anyhow::Result<LoadedModel> {
    info!("Initializing {} from {}", id, model_dir.display());

    let config_path = model_dir.join(CONFIG_FILE);
    let config = if config_path.exists() {
        ModelConfig::from_file(&config_path)?
    } else {
        warn!("{} not found, using GPT-2 defaults", config_path.display());
        serde_json::from_str::<ModelConfig>("{}")?
    };
    info!(
        "📋 Model config: max_position_embeddings={}, bos_token_id={}, eos_token_id={}, vocab_size={}",
        config.max_position_embeddings, config.bos_token_id, config.eos_token_id, config.vocab_size
    );

    let tokenizer_path = model_dir.join(TOKENIZER_FILE);
    if !tokenizer_path.exists() {
        return Err(anyhow!("Tokenizer not found at {}", tokenizer_path.display()));
    }
    let tokenizer = ChatTokenizer::from_file(&tokenizer_path, config.eos_token_id)?;
    info!("✅ Tokenizer loaded, end-of-turn marker {}", tokenizer.eos_token());

    let model_path = model_dir.join(MODEL_FILE);
    if !model_path.exists() {
        return Err(anyhow!("ONNX model not found at {}", model_path.display()));
    }
    let environment = Arc::new(Environment::builder().with_name(id).build()?);
    let model = OnnxModel::from_file(&environment, &model_path, config.max_position_embeddings)?;
    info!("✅ {} ONNX model loaded", id);

    Ok(LoadedModel { tokenizer: Arc::new(tokenizer), model: Arc::new(model) })
}
