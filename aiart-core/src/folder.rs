use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Component, Path, PathBuf};

use image::DynamicImage;
use tempfile::TempDir;

use crate::{encode_png, Error, Result};

/// Named storage location holding input weights/images or receiving
/// generated images.
///
/// Paths are relative to the folder root, `/`-separated and reported with
/// a leading `/`.
pub trait Folder {
    fn name(&self) -> &str;

    /// Path on the local filesystem, if the folder lives there.
    fn local_path(&self) -> Option<&Path>;

    /// Every file in the folder. Directories are not listed.
    fn list_paths(&self) -> Result<Vec<String>>;

    fn reader(&self, path: &str) -> Result<Box<dyn Read + '_>>;

    fn writer(&self, path: &str) -> Result<Box<dyn Write + '_>>;

    /// Removes every entry from the folder.
    fn clear(&self) -> Result<()>;
}

/// Folder backed by a directory.
#[derive(Debug, Clone)]
pub struct LocalFolder {
    name: String,
    root: PathBuf,
}

impl LocalFolder {
    pub fn new(name: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            root: root.into(),
        }
    }

    /// Folder `name` under `root`, created if missing.
    pub fn open(root: &Path, name: &str) -> Result<Self> {
        let folder = Self::new(name, root.join(relative_path(name)?));
        fs::create_dir_all(&folder.root)?;
        Ok(folder)
    }

    fn resolve(&self, path: &str) -> Result<PathBuf> {
        Ok(self.root.join(relative_path(path)?))
    }
}

/// `path` with its leading `/` stripped, refusing anything that would
/// escape the folder root.
fn relative_path(path: &str) -> Result<PathBuf> {
    let relative = Path::new(path.trim_start_matches('/'));
    if relative.as_os_str().is_empty()
        || relative
            .components()
            .any(|component| !matches!(component, Component::Normal(_)))
    {
        return Err(Error::Folder(format!("invalid path in folder: {path:?}")));
    }
    Ok(relative.to_path_buf())
}

fn list_files(root: &Path, dir: &Path, paths: &mut Vec<String>) -> io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            list_files(root, &path, paths)?;
        } else if let Ok(relative) = path.strip_prefix(root) {
            let parts: Vec<_> = relative
                .components()
                .map(|component| component.as_os_str().to_string_lossy())
                .collect();
            paths.push(format!("/{}", parts.join("/")));
        }
    }
    Ok(())
}

impl Folder for LocalFolder {
    fn name(&self) -> &str {
        &self.name
    }

    fn local_path(&self) -> Option<&Path> {
        Some(&self.root)
    }

    fn list_paths(&self) -> Result<Vec<String>> {
        let mut paths = Vec::new();
        if self.root.is_dir() {
            list_files(&self.root, &self.root, &mut paths)?;
        }
        paths.sort();
        Ok(paths)
    }

    fn reader(&self, path: &str) -> Result<Box<dyn Read + '_>> {
        let file = File::open(self.resolve(path)?).map_err(|err| {
            Error::Folder(format!("unable to read {path:?} from folder {:?}: {err}", self.name))
        })?;
        Ok(Box::new(io::BufReader::new(file)))
    }

    fn writer(&self, path: &str) -> Result<Box<dyn Write + '_>> {
        let full_path = self.resolve(path)?;
        if let Some(parent) = full_path.parent() {
            fs::create_dir_all(parent)?;
        }
        Ok(Box::new(File::create(full_path)?))
    }

    fn clear(&self) -> Result<()> {
        if !self.root.is_dir() {
            return Ok(());
        }
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                fs::remove_dir_all(entry.path())?;
            } else {
                fs::remove_file(entry.path())?;
            }
        }
        Ok(())
    }
}

/// Local path of `folder`, or a fresh temporary directory when the folder
/// is not on the local filesystem.
///
/// The temporary directory is deleted when the returned guard is dropped.
pub fn local_path_or_temp(folder: &dyn Folder) -> Result<(PathBuf, Option<TempDir>)> {
    if let Some(path) = folder.local_path() {
        return Ok((path.to_path_buf(), None));
    }
    tracing::warn!(
        "Unable to access the folder {:?} directly because it's not on the local filesystem. \
         The contents of the folder will be copied to a temporary local directory",
        folder.name()
    );
    let temp_dir = tempfile::Builder::new().prefix("aiart-weights-").tempdir()?;
    Ok((temp_dir.path().to_path_buf(), Some(temp_dir)))
}

/// Copies every file of `remote` under `local_path`.
pub fn download_folder(remote: &dyn Folder, local_path: &Path) -> Result<()> {
    for remote_path in remote.list_paths()? {
        let full_local_path = local_path.join(relative_path(&remote_path)?);
        if let Some(parent) = full_local_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut reader = remote.reader(&remote_path)?;
        let mut local_file = File::create(&full_local_path)?;
        io::copy(&mut reader, &mut local_file)?;
    }
    Ok(())
}

/// Writes the images as `{prefix}1.png`, `{prefix}2.png`, ... and returns
/// the written names.
///
/// Stops at the first generation error; files written before it stay.
pub fn save_images<I>(images: I, folder: &dyn Folder, filename_prefix: &str) -> Result<Vec<String>>
where
    I: IntoIterator<Item = Result<DynamicImage>>,
{
    let mut names = Vec::new();
    for (i, image) in images.into_iter().enumerate() {
        let image = image?;
        let filename = format!("{filename_prefix}{}.png", i + 1);

        tracing::info!("Saving image: {filename}");
        let bytes = encode_png(&image)?;
        let mut writer = folder.writer(&filename)?;
        writer.write_all(&bytes)?;
        writer.flush()?;
        names.push(filename);
    }
    Ok(names)
}


#[cfg(test)]
mod tests {
    use super::testing::MemoryFolder;
    use super::*;

    #[test]
    fn lists_files_recursively_with_leading_slash() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("unet/empty")).unwrap();
        fs::write(dir.path().join("model_index.json"), b"{}").unwrap();
        fs::write(dir.path().join("unet/config.json"), b"{}").unwrap();

        let folder = LocalFolder::new("weights", dir.path());
        assert_eq!(
            folder.list_paths().unwrap(),
            ["/model_index.json", "/unet/config.json"]
        );
        assert_eq!(folder.local_path(), Some(dir.path()));
    }

    #[test]
    fn rejects_paths_escaping_the_root() {
        let dir = tempfile::tempdir().unwrap();
        let folder = LocalFolder::new("images", dir.path());
        assert!(folder.writer("../outside.png").is_err());
        assert!(folder.reader("/").is_err());
        assert!(LocalFolder::open(dir.path(), "../up").is_err());
    }

    #[test]
    fn clear_removes_everything() {
        let dir = tempfile::tempdir().unwrap();
        let folder = LocalFolder::open(dir.path(), "images").unwrap();
        folder.writer("a.png").unwrap().write_all(b"a").unwrap();
        folder.writer("nested/b.png").unwrap().write_all(b"b").unwrap();
        folder.clear().unwrap();
        assert!(folder.list_paths().unwrap().is_empty());
        assert!(dir.path().join("images").is_dir());
    }

    #[test]
    fn local_folder_is_used_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let folder = LocalFolder::new("weights", dir.path());
        let (path, temp_dir) = local_path_or_temp(&folder).unwrap();
        assert_eq!(path, dir.path());
        assert!(temp_dir.is_none());
    }

    #[test]
    fn remote_folder_is_downloaded_to_temp_dir() {
        let remote = MemoryFolder::with_files(
            "weights",
            &[("/model_index.json", b"{}"), ("/unet/config.json", b"{\"a\": 1}")],
        );
        let (path, temp_dir) = local_path_or_temp(&remote).unwrap();
        let temp_dir = temp_dir.unwrap();
        assert!(temp_dir
            .path()
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("aiart-weights-"));

        download_folder(&remote, &path).unwrap();
        assert_eq!(fs::read(path.join("model_index.json")).unwrap(), b"{}");
        assert_eq!(fs::read(path.join("unet/config.json")).unwrap(), b"{\"a\": 1}");

        drop(temp_dir);
        assert!(!path.exists());
    }

    #[test]
    fn saves_images_with_sequential_names() {
        let folder = MemoryFolder::with_files("images", &[]);
        let images = (0..3).map(|_| Ok(DynamicImage::new_rgb8(2, 2)));
        let names = save_images(images, &folder, "image").unwrap();
        assert_eq!(names, ["image1.png", "image2.png", "image3.png"]);

        let files = folder.files.borrow();
        assert_eq!(
            files.keys().collect::<Vec<_>>(),
            ["/image1.png", "/image2.png", "/image3.png"]
        );
        assert_eq!(&files["/image1.png"][1..4], b"PNG");
    }

    #[test]
    fn save_stops_at_first_error() {
        let dir = tempfile::tempdir().unwrap();
        let folder = LocalFolder::new("images", dir.path());
        let images = vec![
            Ok(DynamicImage::new_rgb8(2, 2)),
            Err(Error::Config("boom".into())),
            Ok(DynamicImage::new_rgb8(2, 2)),
        ];
        assert!(save_images(images, &folder, "out-").is_err());
        assert_eq!(folder.list_paths().unwrap(), ["/out-1.png"]);
    }
}
