use std::io::{self, Write};

use serde::{Deserialize, Serialize};

use crate::{
    available_devices, compute_revisions, download_folder, local_path_or_temp, save_images,
    DownloadWeightsConfig, Error, Folder, Git, ImageGenerator, ImageToImageParams, Loader,
    LocalFolder, RecipeConfig, RecipeParams, Result, TextToImageParams,
};

/// Generation recipes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RecipeKind {
    TextToImage,
    ImageToImage,
}

serde_plain::derive_display_from_serialize!(RecipeKind);
serde_plain::derive_fromstr_from_deserialize!(RecipeKind);

/// Parameters whose choices are computed dynamically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParameterName {
    Device,
    BaseImagePath,
    Revision,
}

serde_plain::derive_display_from_serialize!(ParameterName);
serde_plain::derive_fromstr_from_deserialize!(ParameterName);

/// One entry of a dynamic select parameter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Choice {
    pub value: String,
    pub label: String,
}

impl Choice {
    pub fn new(value: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            label: label.into(),
        }
    }

    fn same(value: impl Into<String>) -> Self {
        let value = value.into();
        Self {
            label: value.clone(),
            value,
        }
    }
}

fn run_recipe<P, L>(
    params: &P,
    weights_folder: &dyn Folder,
    image_folder: &dyn Folder,
) -> Result<Vec<String>>
where
    P: RecipeParams + std::fmt::Debug,
    L: Loader,
{
    tracing::info!("Generated params: {params:?}");
    tracing::info!("Weights folder: {:?}", weights_folder.name());
    tracing::info!("Image folder: {:?}", image_folder.name());
    let common = params.common();

    // remote folders are copied locally; the temp dir lives until the end
    // of the recipe
    let (weights_path, temp_weights_dir) = local_path_or_temp(weights_folder)?;
    if temp_weights_dir.is_some() {
        tracing::info!("Downloading weights to local folder: {}", weights_path.display());
        download_folder(weights_folder, &weights_path)?;
    }

    let mut generator = ImageGenerator::<P::Task, L::Pipeline>::load::<L>(
        &weights_path,
        common.device_id.as_deref(),
        common.precision,
        common.enable_attention_slicing,
    )?;

    if common.clear_folder {
        tracing::info!("Clearing image folder: {:?}", image_folder.name());
        image_folder.clear()?;
    }

    let request = params.request();
    let images = generator.generate_images(&request)?;
    save_images(images, image_folder, &common.filename_prefix)
}

/// Text-to-image recipe: generates the images and saves them into
/// `image_folder`, returning the written names.
pub fn run_text_to_image<L: Loader>(
    config: &RecipeConfig,
    weights_folder: &dyn Folder,
    image_folder: &dyn Folder,
) -> Result<Vec<String>> {
    let params = TextToImageParams::from_config(config)?;
    run_recipe::<_, L>(&params, weights_folder, image_folder)
}

/// Image-to-image recipe; the base image is read from `base_image_folder`.
pub fn run_image_to_image<L: Loader>(
    config: &RecipeConfig,
    weights_folder: &dyn Folder,
    base_image_folder: &dyn Folder,
    image_folder: &dyn Folder,
) -> Result<Vec<String>> {
    let params = ImageToImageParams::from_config(config, base_image_folder)?;
    run_recipe::<_, L>(&params, weights_folder, image_folder)
}

fn download_message(model_repo: &str) -> String {
    html_escape::encode_quoted_attribute(&format!(
        "Successfully downloaded weights from {model_repo}"
    ))
    .into_owned()
}

/// Shallow-clones the model repo into `weights_folder` and returns an
/// HTML-safe success message.
///
/// LFS is checked first: without it the clone would succeed with pointer
/// files in place of the weights.
pub fn download_weights(
    git: &Git,
    config: &DownloadWeightsConfig,
    weights_folder: &dyn Folder,
) -> Result<String> {
    git.check_lfs()?;
    let model_repo = config.model_repo()?;
    let credentials = config.credentials();

    tracing::info!("Cloning repo: {model_repo}");
    match weights_folder.local_path() {
        Some(path) => {
            git.shallow_clone(&model_repo, path, &config.revision, credentials.as_ref())?;
        }
        None => {
            let (temp_path, _temp_dir) = local_path_or_temp(weights_folder)?;
            let clone_path = temp_path.join("repo");
            git.shallow_clone(&model_repo, &clone_path, &config.revision, credentials.as_ref())?;
            upload_clone(&LocalFolder::new("clone", clone_path), weights_folder)?;
        }
    }

    Ok(download_message(&model_repo))
}

/// Copies a cloned repo into a remote folder, leaving out `.git`.
fn upload_clone(clone: &LocalFolder, weights_folder: &dyn Folder) -> Result<()> {
    for path in clone.list_paths()? {
        if path.starts_with("/.git/") {
            continue;
        }
        let mut reader = clone.reader(&path)?;
        let mut writer = weights_folder.writer(&path)?;
        io::copy(&mut reader, &mut writer)?;
        writer.flush()?;
    }
    Ok(())
}

pub fn device_choices() -> Vec<Choice> {
    let mut choices = vec![
        Choice::new("auto", "Auto"),
        Choice::new("cpu", "CPU (disable GPU)"),
    ];
    choices.extend(available_devices().into_iter().map(|device| {
        let value = device.to_string();
        let label = match device {
            crate::DeviceId::Metal(_) => format!("{value} (Metal)"),
            _ => format!("{value} (CUDA)"),
        };
        Choice::new(value, label)
    }));
    choices
}

pub fn base_image_path_choices(base_image_folder: &dyn Folder) -> Result<Vec<Choice>> {
    let mut paths = base_image_folder.list_paths()?;
    paths.sort();
    Ok(paths.into_iter().map(Choice::same).collect())
}

pub fn revision_choices(git: &Git, config: &serde_json::Value) -> Vec<Choice> {
    let (repo, credentials) = match DownloadWeightsConfig::from_json(config.clone()) {
        Ok(config) => (config.model_repo(), config.credentials()),
        Err(err) => (Err(err), None),
    };
    compute_revisions(git, repo, credentials.as_ref())
        .into_iter()
        .map(Choice::same)
        .collect()
}

/// Choices of `parameter`. `base_image_folder` is needed only for
/// `base_image_path`.
pub fn compute_choices(
    parameter: ParameterName,
    git: &Git,
    config: &serde_json::Value,
    base_image_folder: Option<&dyn Folder>,
) -> Result<Vec<Choice>> {
    match parameter {
        ParameterName::Device => Ok(device_choices()),
        ParameterName::BaseImagePath => {
            let folder = base_image_folder
                .ok_or_else(|| Error::config("undefined input: base_image_folder"))?;
            base_image_path_choices(folder)
        }
        ParameterName::Revision => Ok(revision_choices(git, config)),
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::io::Write;
    use std::str::FromStr;

    use image::GenericImageView;
    use serde_json::json;

    use super::*;
    use crate::folder::testing::MemoryFolder;
    use crate::pipeline::testing::MockLoader;
    use crate::{encode_png, DeviceId};

    fn weights(dir: &tempfile::TempDir) -> LocalFolder {
        let folder = LocalFolder::open(dir.path(), "weights").unwrap();
        folder.writer("model_index.json").unwrap().write_all(b"{}").unwrap();
        folder
    }

    #[test]
    fn recipe_and_parameter_names() {
        assert_eq!(RecipeKind::from_str("text-to-image").unwrap(), RecipeKind::TextToImage);
        assert_eq!(RecipeKind::ImageToImage.to_string(), "image-to-image");
        assert!(RecipeKind::from_str("inpainting").is_err());
        assert_eq!(
            ParameterName::from_str("base_image_path").unwrap(),
            ParameterName::BaseImagePath
        );
    }

    #[test]
    fn text_to_image_saves_every_image() {
        let dir = tempfile::tempdir().unwrap();
        let weights = weights(&dir);
        let images = LocalFolder::open(dir.path(), "images").unwrap();

        let config = RecipeConfig::from_json(json!({
            "prompt": "PROMPT",
            "image_count": 5,
            "batch_size": 2,
            "filename_prefix": "cat-",
            "device": "cpu",
        }))
        .unwrap();
        let names = run_text_to_image::<MockLoader>(&config, &weights, &images).unwrap();
        assert_eq!(names, ["cat-1.png", "cat-2.png", "cat-3.png", "cat-4.png", "cat-5.png"]);

        // the mock fills the n-th image with the value n
        let third = image::open(dir.path().join("images/cat-3.png")).unwrap();
        assert_eq!(third.get_pixel(0, 0).0[0], 3);
    }

    #[test]
    fn clear_folder_runs_after_load() {
        let dir = tempfile::tempdir().unwrap();
        let weights = weights(&dir);
        let images = LocalFolder::open(dir.path(), "images").unwrap();
        images.writer("old.png").unwrap().write_all(b"old").unwrap();

        let config = RecipeConfig::from_json(json!({ "prompt": "P", "clear_folder": true })).unwrap();
        run_text_to_image::<MockLoader>(&config, &weights, &images).unwrap();
        assert_eq!(images.list_paths().unwrap(), ["/image1.png"]);
    }

    #[test]
    fn remote_weights_are_downloaded_first() {
        let dir = tempfile::tempdir().unwrap();
        let weights = MemoryFolder::with_files("weights", &[("/model_index.json", b"{}")]);
        let images = LocalFolder::open(dir.path(), "images").unwrap();

        let config = RecipeConfig::from_json(json!({ "prompt": "P" })).unwrap();
        let names = run_text_to_image::<MockLoader>(&config, &weights, &images).unwrap();
        assert_eq!(names, ["image1.png"]);
    }

    #[test]
    fn invalid_config_leaves_output_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let weights = weights(&dir);
        let images = LocalFolder::open(dir.path(), "images").unwrap();
        images.writer("old.png").unwrap().write_all(b"old").unwrap();

        let config = RecipeConfig::from_json(json!({
            "prompt": "P",
            "clear_folder": true,
            "image_width": 100,
        }))
        .unwrap();
        let err = run_text_to_image::<MockLoader>(&config, &weights, &images).unwrap_err();
        assert!(err.is_config());
        assert_eq!(images.list_paths().unwrap(), ["/old.png"]);
    }

    #[test]
    fn image_to_image_recipe() {
        let dir = tempfile::tempdir().unwrap();
        let weights = weights(&dir);
        let base = LocalFolder::open(dir.path(), "base").unwrap();
        let bytes = encode_png(&image::DynamicImage::new_rgb8(64, 64)).unwrap();
        base.writer("nested/base.png").unwrap().write_all(&bytes).unwrap();
        let images = LocalFolder::open(dir.path(), "images").unwrap();

        let config = RecipeConfig::from_json(json!({
            "prompt": "P",
            "image_count": 2,
            "base_image_path": "/nested/base.png",
            "strength": 0.5,
        }))
        .unwrap();
        let names = run_image_to_image::<MockLoader>(&config, &weights, &base, &images).unwrap();
        assert_eq!(names, ["image1.png", "image2.png"]);
    }

    #[test]
    fn download_message_is_html_escaped() {
        assert_eq!(
            download_message("<a href=\"x\">Tom & Jerry's</a>"),
            "Successfully downloaded weights from \
             &lt;a href=&quot;x&quot;&gt;Tom &amp; Jerry&#x27;s&lt;/a&gt;"
        );
    }

    #[test]
    fn download_fails_fast_without_lfs() {
        let dir = tempfile::tempdir().unwrap();
        let weights = LocalFolder::open(dir.path(), "weights").unwrap();
        let config = DownloadWeightsConfig::from_json(json!({ "model_repo": "CUSTOM" })).unwrap();

        // the LFS check comes before the repo is even resolved
        let err = download_weights(&Git::new("/nonexistent/git"), &config, &weights).unwrap_err();
        assert!(matches!(err, Error::LfsNotInstalled { .. }));
    }

    #[test]
    fn base_image_choices_are_sorted() {
        let folder = MemoryFolder::with_files("base", &[("/b.png", b""), ("/a/c.png", b"")]);
        let choices = base_image_path_choices(&folder).unwrap();
        assert_eq!(
            choices,
            [Choice::same("/a/c.png"), Choice::same("/b.png")]
        );
    }

    #[test]
    fn device_choices_start_with_auto_and_cpu() {
        let choices = device_choices();
        assert_eq!(choices[0], Choice::new("auto", "Auto"));
        assert_eq!(choices[1].value, "cpu");
        for choice in &choices[2..] {
            assert!(!matches!(DeviceId::parse(&choice.value), DeviceId::Unknown(_)));
        }
    }

    #[test]
    fn revision_choices_fall_back_to_defaults() {
        let git = Git::new("/nonexistent/git");
        let choices = compute_choices(
            ParameterName::Revision,
            &git,
            &json!({ "model_repo": "org/model" }),
            None,
        )
        .unwrap();
        assert_eq!(choices, [Choice::same("fp16"), Choice::same("main")]);

        let err = compute_choices(ParameterName::BaseImagePath, &git, &json!({}), None).unwrap_err();
        assert!(err.is_config());
    }

    #[cfg(unix)]
    #[test]
    fn download_clones_into_local_folder() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let program = dir.path().join("git");
        // the last argument of `clone` is the target directory
        fs::write(
            &program,
            "#!/bin/sh\nif [ \"$1\" = clone ]; then for last; do :; done; mkdir -p \"$last\"; echo weights > \"$last/model.safetensors\"; fi\nexit 0\n",
        )
        .unwrap();
        fs::set_permissions(&program, fs::Permissions::from_mode(0o755)).unwrap();

        let weights = LocalFolder::open(dir.path(), "weights").unwrap();
        let config = DownloadWeightsConfig::from_json(json!({
            "model_repo": "org/<model>",
            "revision": "fp16",
        }))
        .unwrap();
        let message = download_weights(&Git::new(&program), &config, &weights).unwrap();
        assert_eq!(
            message,
            "Successfully downloaded weights from https://huggingface.co/org/&lt;model&gt;"
        );
        assert_eq!(weights.list_paths().unwrap(), ["/model.safetensors"]);

        let remote = MemoryFolder::with_files("weights", &[]);
        download_weights(&Git::new(&program), &config, &remote).unwrap();
        assert_eq!(remote.list_paths().unwrap(), ["/model.safetensors"]);
    }
}
