use std::path::{Path, PathBuf};

use actix_multipart::{Field, Multipart};
use actix_web::{dev::Payload, http::header::HeaderMap};
use futures::{StreamExt, TryStreamExt};
use tokio::{fs, io::AsyncWriteExt};
use tracing::warn;
use uuid::Uuid;

use crate::{FormConfig, FormError};

/// A file as stored by the parser.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineFile {
    pub path: PathBuf,
    pub name: String,
    pub content_type: String,
    pub size: u64,
}

/// Events produced while a form is parsed.
///
/// Any number of `Field` and `File` events in part order, then exactly one
/// of `Error` or `End`.
#[derive(Debug)]
pub enum FormEvent {
    Field(String, String),
    File(String, EngineFile),
    Error(FormError),
    End,
}

/// Multipart form parser writing uploads to the configured directory.
pub struct IncomingForm {
    config: FormConfig,
    multipart: Option<Multipart>,
    fields_size: u64,
    finished: bool,
}

impl IncomingForm {
    pub fn new(config: FormConfig) -> Self {
        Self {
            config,
            multipart: None,
            fields_size: 0,
            finished: false,
        }
    }

    pub fn config(&self) -> &FormConfig {
        &self.config
    }

    /// Whether [`IncomingForm::parse`] was called.
    pub fn is_parsing(&self) -> bool {
        self.multipart.is_some()
    }

    /// Start consuming `payload`. Only the first call has an effect.
    pub fn parse(&mut self, headers: &HeaderMap, payload: Payload) {
        if self.multipart.is_some() || self.finished {
            return;
        }

        self.multipart = Some(Multipart::new(headers, payload));
    }

    /// Read up to the next complete part. A form that was never given a
    /// payload ends immediately.
    pub async fn next_event(&mut self) -> FormEvent {
        if self.finished {
            return FormEvent::End;
        }

        match self.step().await {
            Ok(Some(event)) => event,
            Ok(None) => {
                self.finished = true;
                FormEvent::End
            }
            Err(err) => {
                self.finished = true;
                FormEvent::Error(err)
            }
        }
    }

    async fn step(&mut self) -> Result<Option<FormEvent>, FormError> {
        let multipart = match self.multipart.as_mut() {
            Some(multipart) => multipart,
            None => return Ok(None),
        };

        while let Some(mut field) = multipart.try_next().await? {
            let disposition = field.content_disposition().clone();

            let part_name = match disposition.get_name() {
                Some(v) => v.to_owned(),
                None => {
                    // Drain the nameless part before moving on
                    while field.try_next().await?.is_some() {}
                    continue;
                }
            };

            let event = match disposition.get_filename() {
                Some(filename) => {
                    let content_type = field.content_type().to_string();
                    let file = store_file(
                        &self.config,
                        &part_name,
                        filename.to_owned(),
                        content_type,
                        &mut field,
                    )
                    .await?;

                    FormEvent::File(part_name, file)
                }
                None => {
                    let value =
                        read_text(&self.config, &mut self.fields_size, &part_name, &mut field)
                            .await?;

                    FormEvent::Field(part_name, value)
                }
            };

            return Ok(Some(event));
        }

        Ok(None)
    }
}

/// Random name for a stored upload, keeping the client's extension if asked.
fn temp_file_name(original: &str, keep_extensions: bool) -> String {
    let mut name = Uuid::new_v4().simple().to_string();

    if keep_extensions {
        if let Some(ext) = Path::new(original).extension().and_then(|e| e.to_str()) {
            name.push('.');
            name.push_str(ext);
        }
    }

    name
}

async fn store_file(
    config: &FormConfig,
    part_name: &str,
    name: String,
    content_type: String,
    field: &mut Field,
) -> Result<EngineFile, FormError> {
    fs::create_dir_all(config.upload_dir()).await?;

    let path = config
        .upload_dir()
        .join(temp_file_name(&name, config.keep_extensions()));
    let mut file = fs::File::create(&path).await?;

    let written = write_part(config, part_name, &mut file, field).await;
    drop(file);

    match written {
        Ok(size) => Ok(EngineFile {
            path,
            name,
            content_type,
            size,
        }),
        Err(err) => {
            if let Err(remove_err) = fs::remove_file(&path).await {
                warn!(path = %path.display(), error = %remove_err, "failed to remove partial upload");
            }
            Err(err)
        }
    }
}

async fn write_part(
    config: &FormConfig,
    part_name: &str,
    file: &mut fs::File,
    field: &mut Field,
) -> Result<u64, FormError> {
    let mut size = 0u64;

    while let Some(chunk) = field.next().await {
        let bytes = chunk?;
        size += bytes.len() as u64;

        if let Some(limit) = config.max_file_size() {
            if size > limit {
                return Err(FormError::FileTooLarge {
                    field: part_name.to_owned(),
                    limit,
                });
            }
        }

        file.write_all(&bytes).await?;
    }

    file.flush().await?;
    Ok(size)
}

async fn read_text(
    config: &FormConfig,
    fields_size: &mut u64,
    part_name: &str,
    field: &mut Field,
) -> Result<String, FormError> {
    let mut data = Vec::new();

    while let Some(bytes) = field.try_next().await? {
        *fields_size += bytes.len() as u64;
        if *fields_size > config.max_fields_size() {
            return Err(FormError::FieldsTooLarge {
                limit: config.max_fields_size(),
            });
        }

        data.extend_from_slice(&bytes);
    }

    config
        .encoding()
        .decode(&data)
        .ok_or_else(|| FormError::Decode {
            field: part_name.to_owned(),
            encoding: config.encoding(),
        })
}
