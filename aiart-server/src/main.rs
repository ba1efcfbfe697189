use std::path::PathBuf;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use aiart_core::pipeline::{StableDiffusionLoader, StableDiffusionPipeline};
use aiart_core::{
    compute_choices, download_weights, encode_png, run_image_to_image, run_text_to_image, Choice,
    DownloadWeightsConfig, Folder, GenerationRequest, Git, LocalFolder, ParameterName, Precision,
    RecipeConfig, RecipeKind, TextToImageGenerator, TextToImageOptions,
};
use anyhow::Result;
use axum::{
    extract::{Json, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::post,
    Router,
};
use base64::{prelude::BASE64_STANDARD, Engine};
use clap::Parser;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(author, version, about = "AI art image generation server")]
struct Args {
    /// Host address to bind the server to
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Port to bind the server to
    #[arg(long, default_value_t = 8000)]
    port: u16,

    /// Root directory of the managed folders, one sub-directory per folder
    #[arg(long, default_value = "folders")]
    folders: PathBuf,

    /// Weights directory to preload for /v1/images/generations
    #[arg(long)]
    weights: Option<PathBuf>,

    /// Device for the preloaded model (cpu, cuda:N, metal); auto-selected when unset
    #[arg(long)]
    device: Option<String>,

    /// Load the preloaded model in half precision
    #[arg(long)]
    half_precision: bool,

    /// Enable attention slicing on the preloaded model
    #[arg(long)]
    attention_slicing: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

struct AppState {
    folders: PathBuf,
    git: Git,
    generator: Option<Mutex<TextToImageGenerator>>,
}

impl AppState {
    fn folder(&self, name: &str) -> Result<LocalFolder, ApiError> {
        Ok(LocalFolder::open(&self.folders, name)?)
    }
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl From<aiart_core::Error> for ApiError {
    fn from(err: aiart_core::Error) -> Self {
        let status = if err.is_config() {
            StatusCode::BAD_REQUEST
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        };
        Self::new(status, err.to_string())
    }
}

impl From<tokio::task::JoinError> for ApiError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::error!("{}", self.message);
        }
        (self.status, Json(ErrorResponse { error: self.message })).into_response()
    }
}

/// Runs blocking model/filesystem work off the async runtime.
async fn blocking<T, F>(work: F) -> Result<T, ApiError>
where
    F: FnOnce() -> Result<T, ApiError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work).await?
}

#[derive(Deserialize, Debug)]
struct RecipeInputs {
    weights_folder: String,
    base_image_folder: Option<String>,
}

#[derive(Deserialize, Debug)]
struct RecipeOutputs {
    image_folder: String,
}

#[derive(Deserialize, Debug)]
struct RecipeRequest {
    config: serde_json::Value,
    inputs: RecipeInputs,
    outputs: RecipeOutputs,
}

#[derive(Serialize, Debug)]
struct RecipeResponse {
    images: Vec<String>,
}

async fn run_recipe_handler(
    State(state): State<Arc<AppState>>,
    Path(kind): Path<String>,
    Json(req): Json<RecipeRequest>,
) -> Result<Json<RecipeResponse>, ApiError> {
    let kind = RecipeKind::from_str(&kind)
        .map_err(|_| ApiError::new(StatusCode::NOT_FOUND, format!("unknown recipe: {kind}")))?;
    tracing::info!("Running recipe {kind}");

    let images = blocking(move || {
        let config = RecipeConfig::from_json(req.config)?;
        let weights_folder = state.folder(&req.inputs.weights_folder)?;
        let image_folder = state.folder(&req.outputs.image_folder)?;
        let images = match kind {
            RecipeKind::TextToImage => run_text_to_image::<StableDiffusionLoader>(
                &config,
                &weights_folder,
                &image_folder,
            )?,
            RecipeKind::ImageToImage => {
                let name = req.inputs.base_image_folder.as_deref().ok_or_else(|| {
                    ApiError::new(StatusCode::BAD_REQUEST, "undefined input: base_image_folder")
                })?;
                let base_image_folder = state.folder(name)?;
                run_image_to_image::<StableDiffusionLoader>(
                    &config,
                    &weights_folder,
                    &base_image_folder,
                    &image_folder,
                )?
            }
        };
        Ok(images)
    })
    .await?;

    Ok(Json(RecipeResponse { images }))
}

#[derive(Deserialize, Debug)]
struct RunnableRequest {
    config: serde_json::Value,
}

#[derive(Serialize, Debug)]
struct RunnableResponse {
    message: String,
}

async fn download_weights_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RunnableRequest>,
) -> Result<Json<RunnableResponse>, ApiError> {
    let message = blocking(move || {
        let folder_name = req
            .config
            .get("weights_folder")
            .and_then(|name| name.as_str())
            .ok_or_else(|| {
                ApiError::new(StatusCode::BAD_REQUEST, "undefined parameter: weights_folder")
            })?
            .to_string();
        let config = DownloadWeightsConfig::from_json(req.config)?;
        let weights_folder = state.folder(&folder_name)?;
        Ok(download_weights(&state.git, &config, &weights_folder)?)
    })
    .await?;

    Ok(Json(RunnableResponse { message }))
}

#[derive(Deserialize, Debug, Default)]
struct ParamsInputs {
    base_image_folder: Option<String>,
}

#[derive(Deserialize, Debug)]
struct ParamsRequest {
    #[serde(default)]
    config: serde_json::Value,
    #[serde(default)]
    inputs: ParamsInputs,
}

#[derive(Serialize, Debug)]
struct ParamsResponse {
    choices: Vec<Choice>,
}

async fn compute_params_handler(
    State(state): State<Arc<AppState>>,
    Path(parameter): Path<String>,
    Json(req): Json<ParamsRequest>,
) -> Result<Json<ParamsResponse>, ApiError> {
    let parameter = ParameterName::from_str(&parameter).map_err(|_| {
        ApiError::new(StatusCode::NOT_FOUND, format!("unknown parameter: {parameter}"))
    })?;

    let choices = blocking(move || {
        let base_image_folder = match req.inputs.base_image_folder.as_deref() {
            Some(name) => Some(state.folder(name)?),
            None => None,
        };
        let choices = compute_choices(
            parameter,
            &state.git,
            &req.config,
            base_image_folder.as_ref().map(|folder| folder as &dyn Folder),
        )?;
        Ok(choices)
    })
    .await?;

    Ok(Json(ParamsResponse { choices }))
}

#[derive(Deserialize, Debug)]
struct GenerationBody {
    prompt: String,
    count: Option<usize>,
    batch_size: Option<usize>,
    width: Option<usize>,
    height: Option<usize>,
    steps: Option<usize>,
    guidance: Option<f64>,
    seed: Option<u64>,
}

impl GenerationBody {
    fn into_request(self) -> GenerationRequest<TextToImageOptions> {
        let defaults = TextToImageOptions::default();
        let options = TextToImageOptions {
            height: self.height.unwrap_or(defaults.height),
            width: self.width.unwrap_or(defaults.width),
        };
        let mut request = GenerationRequest::new(self.prompt, options)
            .with_image_count(self.count.unwrap_or(1))
            .with_batch_size(self.batch_size)
            .with_random_seed(self.seed);
        if let Some(steps) = self.steps {
            request = request.with_num_inference_steps(steps);
        }
        if let Some(guidance) = self.guidance {
            request = request.with_guidance_scale(guidance);
        }
        request
    }
}

#[derive(Serialize, Debug)]
struct GenerationResponse {
    images: Vec<String>,
}

async fn generate_images_handler(
    State(state): State<Arc<AppState>>,
    Json(body): Json<GenerationBody>,
) -> Result<Json<GenerationResponse>, ApiError> {
    if state.generator.is_none() {
        return Err(ApiError::new(
            StatusCode::SERVICE_UNAVAILABLE,
            "no model is loaded; start the server with --weights",
        ));
    }
    let request = body.into_request();

    let images = blocking(move || {
        let Some(generator) = state.generator.as_ref() else {
            return Err(ApiError::new(StatusCode::SERVICE_UNAVAILABLE, "no model is loaded"));
        };
        let mut generator = generator
            .lock()
            .map_err(|_| {
                ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "generator lock poisoned")
            })?;

        let mut images = Vec::new();
        for image in generator.generate_images(&request)? {
            images.push(BASE64_STANDARD.encode(encode_png(&image?)?));
        }
        Ok(images)
    })
    .await?;

    Ok(Json(GenerationResponse { images }))
}

/// `auto` (or nothing) lets the core pick the device, as for recipes.
fn preload_device(device: Option<&str>) -> Option<String> {
    match device.map(str::trim) {
        None | Some("" | "auto") => None,
        Some(device) => Some(device.to_string()),
    }
}

fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/recipes/{kind}", post(run_recipe_handler))
        .route("/v1/runnables/download-weights", post(download_weights_handler))
        .route("/v1/params/{parameter}", post(compute_params_handler))
        .route("/v1/images/generations", post(generate_images_handler))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!("aiart_server={log_level},aiart_core={log_level}").into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    std::fs::create_dir_all(&args.folders)?;

    let generator = match args.weights.clone() {
        Some(weights) => {
            let device = preload_device(args.device.as_deref());
            let precision = Precision::from_half(args.half_precision);
            let attention_slicing = args.attention_slicing;
            let generator = tokio::task::spawn_blocking(move || {
                TextToImageGenerator::<StableDiffusionPipeline>::from_pretrained(
                    &weights,
                    device.as_deref(),
                    precision,
                    attention_slicing,
                )
            })
            .await??;
            Some(Mutex::new(generator))
        }
        None => {
            tracing::info!("No --weights given, /v1/images/generations is disabled");
            None
        }
    };

    let state = Arc::new(AppState {
        folders: args.folders,
        git: Git::default(),
        generator,
    });

    let bind_address = format!("{}:{}", args.host, args.port);
    let listener = TcpListener::bind(&bind_address).await?;
    tracing::info!("Started server on {}", listener.local_addr()?);
    axum::serve(listener, router(state).into_make_service()).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(folders: &std::path::Path) -> Arc<AppState> {
        Arc::new(AppState {
            folders: folders.to_path_buf(),
            git: Git::new("/nonexistent/git"),
            generator: None,
        })
    }

    #[test]
    fn generation_body_defaults() {
        let body: GenerationBody = serde_json::from_str(r#"{"prompt": "a cat"}"#).unwrap();
        let request = body.into_request();
        assert_eq!(request.prompt, "a cat");
        assert_eq!(request.image_count, 1);
        assert_eq!(request.batch_size, None);
        assert_eq!(request.num_inference_steps, 50);
        assert_eq!(request.guidance_scale, 7.5);
        assert_eq!(request.options, TextToImageOptions { height: 512, width: 512 });
    }

    #[test]
    fn generation_body_overrides() {
        let body: GenerationBody = serde_json::from_str(
            r#"{"prompt": "a cat", "count": 4, "batch_size": 2, "width": 768, "height": 256,
                "steps": 20, "guidance": 5.0, "seed": 7}"#,
        )
        .unwrap();
        let request = body.into_request();
        assert_eq!(request.image_count, 4);
        assert_eq!(request.batch_size, Some(2));
        assert_eq!(request.random_seed, Some(7));
        assert_eq!(request.num_inference_steps, 20);
        assert_eq!(request.guidance_scale, 5.0);
        assert_eq!(request.options, TextToImageOptions { height: 256, width: 768 });
    }

    #[test]
    fn auto_device_is_auto_selected() {
        assert_eq!(preload_device(None), None);
        assert_eq!(preload_device(Some("auto")), None);
        assert_eq!(preload_device(Some(" ")), None);
        assert_eq!(preload_device(Some("cuda:1")).as_deref(), Some("cuda:1"));
    }

    #[test]
    fn config_errors_are_bad_requests() {
        let err = ApiError::from(aiart_core::Error::config("bad"));
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        let err = ApiError::from(aiart_core::Error::ModelLoading("missing".into()));
        assert_eq!(err.status, StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn generations_need_a_preloaded_model() {
        let dir = tempfile::tempdir().unwrap();
        let body: GenerationBody = serde_json::from_str(r#"{"prompt": "a cat"}"#).unwrap();
        let err = generate_images_handler(State(state(dir.path())), Json(body))
            .await
            .unwrap_err();
        assert_eq!(err.status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn invalid_recipe_config_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let req: RecipeRequest = serde_json::from_value(serde_json::json!({
            "config": { "prompt": "a cat", "image_height": 100 },
            "inputs": { "weights_folder": "weights" },
            "outputs": { "image_folder": "images" },
        }))
        .unwrap();
        let err = run_recipe_handler(State(state(dir.path())), Path("text-to-image".into()), Json(req))
            .await
            .unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn unknown_recipe_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let req: RecipeRequest = serde_json::from_value(serde_json::json!({
            "config": { "prompt": "a cat" },
            "inputs": { "weights_folder": "weights" },
            "outputs": { "image_folder": "images" },
        }))
        .unwrap();
        let err = run_recipe_handler(State(state(dir.path())), Path("inpainting".into()), Json(req))
            .await
            .unwrap_err();
        assert_eq!(err.status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn download_without_lfs_is_a_server_error() {
        let dir = tempfile::tempdir().unwrap();
        let req = RunnableRequest {
            config: serde_json::json!({ "weights_folder": "weights", "model_repo": "org/model" }),
        };
        let err = download_weights_handler(State(state(dir.path())), Json(req))
            .await
            .unwrap_err();
        assert_eq!(err.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(err.message.contains("Git LFS"));
    }

    #[tokio::test]
    async fn base_image_choices_come_from_the_folder() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("base")).unwrap();
        std::fs::write(dir.path().join("base/b.png"), b"").unwrap();
        std::fs::write(dir.path().join("base/a.png"), b"").unwrap();

        let req: ParamsRequest = serde_json::from_value(serde_json::json!({
            "inputs": { "base_image_folder": "base" },
        }))
        .unwrap();
        let Json(response) =
            compute_params_handler(State(state(dir.path())), Path("base_image_path".into()), Json(req))
                .await
                .unwrap();
        let values: Vec<_> = response.choices.iter().map(|c| c.value.as_str()).collect();
        assert_eq!(values, ["/a.png", "/b.png"]);
    }
}
