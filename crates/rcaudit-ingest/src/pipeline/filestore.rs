//! Attachment storage backends.
//!
//! Rocket.Chat keeps uploads either on a filesystem (`<root>/<file_id>`) or
//! in a GridFS bucket (`rocketchat_uploads` by default). Both are read as a
//! stream so large files are never buffered whole.

use crate::{Error, Result};
use bson::{Bson, Document, doc};
use mongodb::error::{ErrorKind, GridFsErrorKind};
use mongodb::gridfs::{GridFsBucket, GridFsDownloadStream};
use mongodb::options::GridFsBucketOptions;
use mongodb::{Client, Collection};
use std::path::PathBuf;
use std::str::FromStr;

/// Default GridFS bucket used by Rocket.Chat for uploads.
pub const DEFAULT_GRIDFS_BUCKET: &str = "rocketchat_uploads";

/// Where attachments are read from, as given on the command line.
///
/// `gridfs` or `gridfs:<bucket>` selects GridFS; anything else is a
/// filesystem path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileStoreLocation {
    FileSystem(PathBuf),
    GridFs { bucket: String },
}

impl FromStr for FileStoreLocation {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.strip_prefix("gridfs") {
            Some("") => Ok(Self::GridFs {
                bucket: DEFAULT_GRIDFS_BUCKET.to_string(),
            }),
            Some(rest) => match rest.strip_prefix(':') {
                Some(bucket) if !bucket.is_empty() => Ok(Self::GridFs {
                    bucket: bucket.to_string(),
                }),
                Some(_) => Err(Error::Config("empty GridFS bucket name".to_string())),
                None => Ok(Self::FileSystem(PathBuf::from(s))),
            },
            None if s.is_empty() => Err(Error::Config("empty file store location".to_string())),
            None => Ok(Self::FileSystem(PathBuf::from(s))),
        }
    }
}

/// An opened attachment backend.
pub enum FileStore {
    FileSystem {
        root: PathBuf,
    },
    GridFs {
        name: String,
        bucket: GridFsBucket,
        files: Collection<Document>,
    },
}

impl FileStore {
    pub fn filesystem(root: impl Into<PathBuf>) -> Self {
        Self::FileSystem { root: root.into() }
    }

    pub fn gridfs(client: &Client, database: &str, bucket: &str) -> Self {
        let db = client.database(database);
        let options = GridFsBucketOptions::builder()
            .bucket_name(bucket.to_string())
            .build();
        Self::GridFs {
            name: bucket.to_string(),
            bucket: db.gridfs_bucket(options),
            files: db.collection(&format!("{bucket}.files")),
        }
    }

    /// Open the backend named by `location`.
    pub fn open_location(location: &FileStoreLocation, client: Option<&Client>, database: &str) -> Result<Self> {
        match location {
            FileStoreLocation::FileSystem(root) => Ok(Self::filesystem(root.clone())),
            FileStoreLocation::GridFs { bucket } => {
                let client = client.ok_or_else(|| {
                    Error::Config("GridFS file store requires a MongoDB connection".to_string())
                })?;
                Ok(Self::gridfs(client, database, bucket))
            }
        }
    }

    /// Human-readable locator of a file, recorded in archive entries.
    pub fn locator(&self, file_id: &str) -> String {
        match self {
            Self::FileSystem { root } => format!("fs:{}", root.join(file_id).display()),
            Self::GridFs { name, .. } => format!("gridfs:{name}/{file_id}"),
        }
    }

    /// Open a file for streaming, with its expected size when the backend
    /// records one.
    pub async fn open(&self, file_id: &str) -> Result<(ContentReader, Option<u64>)> {
        match self {
            Self::FileSystem { root } => {
                if file_id.is_empty() || file_id.contains(['/', '\\']) || file_id == ".." {
                    return Err(Error::NotFound(format!("invalid file id '{file_id}'")));
                }
                let path = root.join(file_id);
                let file = match tokio::fs::File::open(&path).await {
                    Ok(file) => file,
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                        return Err(Error::NotFound(path.display().to_string()));
                    }
                    Err(e) => return Err(e.into()),
                };
                let len = file.metadata().await?.len();
                Ok((ContentReader::File(file), Some(len)))
            }
            Self::GridFs {
                name,
                bucket,
                files,
            } => {
                let id = Bson::String(file_id.to_string());
                let length = files
                    .find_one(doc! { "_id": id.clone() })
                    .await?
                    .and_then(|f| match f.get("length") {
                        Some(Bson::Int64(n)) => u64::try_from(*n).ok(),
                        Some(Bson::Int32(n)) => u64::try_from(*n).ok(),
                        _ => None,
                    });

                match bucket.open_download_stream(id).await {
                    Ok(stream) => Ok((ContentReader::GridFs(Box::new(stream)), length)),
                    Err(e) if is_file_not_found(&e) => {
                        Err(Error::NotFound(format!("gridfs:{name}/{file_id}")))
                    }
                    Err(e) => Err(e.into()),
                }
            }
        }
    }
}

fn is_file_not_found(err: &mongodb::error::Error) -> bool {
    matches!(
        err.kind.as_ref(),
        ErrorKind::GridFs(GridFsErrorKind::FileNotFound { .. })
    )
}

/// Streaming reader over an attachment's content.
pub enum ContentReader {
    File(tokio::fs::File),
    GridFs(Box<GridFsDownloadStream>),
}

impl ContentReader {
    /// Read the next chunk into `buf`; zero means end of content.
    pub async fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            Self::File(file) => tokio::io::AsyncReadExt::read(file, buf).await,
            Self::GridFs(stream) => futures::AsyncReadExt::read(&mut **stream, buf).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_locations() {
        assert_eq!(
            "gridfs".parse::<FileStoreLocation>().unwrap(),
            FileStoreLocation::GridFs {
                bucket: DEFAULT_GRIDFS_BUCKET.to_string()
            }
        );
        assert_eq!(
            "gridfs:custom_uploads".parse::<FileStoreLocation>().unwrap(),
            FileStoreLocation::GridFs {
                bucket: "custom_uploads".to_string()
            }
        );
        assert_eq!(
            "/var/uploads".parse::<FileStoreLocation>().unwrap(),
            FileStoreLocation::FileSystem(PathBuf::from("/var/uploads"))
        );
        assert_eq!(
            "gridfs-backup".parse::<FileStoreLocation>().unwrap(),
            FileStoreLocation::FileSystem(PathBuf::from("gridfs-backup"))
        );
        assert!("gridfs:".parse::<FileStoreLocation>().is_err());
        assert!("".parse::<FileStoreLocation>().is_err());
    }

    #[tokio::test]
    async fn test_filesystem_streams_content() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("f1"), b"hello world").unwrap();
        let store = FileStore::filesystem(tmp.path());

        let (mut reader, len) = store.open("f1").await.unwrap();
        assert_eq!(len, Some(11));

        let mut content = Vec::new();
        let mut buf = [0u8; 4];
        loop {
            let n = reader.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            content.extend_from_slice(&buf[..n]);
        }
        assert_eq!(content, b"hello world");
        assert!(store.locator("f1").starts_with("fs:"));
    }

    #[tokio::test]
    async fn test_filesystem_missing_file_is_not_found() {
        let tmp = TempDir::new().unwrap();
        let store = FileStore::filesystem(tmp.path());
        assert!(matches!(store.open("nope").await, Err(Error::NotFound(_))));
        assert!(matches!(store.open("../etc").await, Err(Error::NotFound(_))));
    }
}
