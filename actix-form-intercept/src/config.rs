use std::{collections::BTreeMap, fmt, path::Path, path::PathBuf, str::FromStr};

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::FormError;

/// Default cap on the combined size of all text fields in one request.
pub const DEFAULT_MAX_FIELDS_SIZE: u64 = 2 * 1024 * 1024;

pub const DEFAULT_ENCODING: &str = "utf8";
pub const DEFAULT_UPLOAD_DIR: &str = "/tmp";

/// Charset used to turn the bytes of a text field into a string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Utf8,
    /// Each byte with its high bit stripped.
    Ascii,
    /// Each byte mapped to the code point of the same value.
    Latin1,
    Hex,
}

impl Encoding {
    /// Decode raw field bytes. Returns `None` when the bytes are not valid
    /// for this encoding.
    pub fn decode(&self, bytes: &[u8]) -> Option<String> {
        match self {
            Encoding::Utf8 => String::from_utf8(bytes.to_vec()).ok(),
            Encoding::Ascii => Some(bytes.iter().map(|b| (b & 0x7f) as char).collect()),
            Encoding::Latin1 => Some(bytes.iter().map(|&b| b as char).collect()),
            Encoding::Hex => Some(bytes.iter().map(|b| format!("{:02x}", b)).collect()),
        }
    }
}

impl FromStr for Encoding {
    type Err = FormError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "utf8" | "utf-8" => Ok(Encoding::Utf8),
            "ascii" => Ok(Encoding::Ascii),
            "latin1" | "binary" => Ok(Encoding::Latin1),
            "hex" => Ok(Encoding::Hex),
            _ => Err(FormError::Config {
                key: "encoding",
                reason: format!("unsupported encoding `{}`", s),
            }),
        }
    }
}

impl fmt::Display for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Encoding::Utf8 => "utf8",
            Encoding::Ascii => "ascii",
            Encoding::Latin1 => "latin1",
            Encoding::Hex => "hex",
        })
    }
}

/// A size given either in bytes or as a human readable string (`"10 MiB"`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SizeOption {
    Bytes(u64),
    Human(String),
}

impl SizeOption {
    fn resolve(&self, key: &'static str) -> Result<u64, FormError> {
        match self {
            SizeOption::Bytes(bytes) => Ok(*bytes),
            SizeOption::Human(text) => {
                parse_size::parse_size(text).map_err(|err| FormError::Config {
                    key,
                    reason: format!("invalid size `{}`: {}", text, err),
                })
            }
        }
    }
}

impl From<u64> for SizeOption {
    fn from(bytes: u64) -> Self {
        SizeOption::Bytes(bytes)
    }
}

impl From<&str> for SizeOption {
    fn from(text: &str) -> Self {
        SizeOption::Human(text.to_owned())
    }
}

fn lenient_bool<'de, D>(deserializer: D) -> Result<Option<bool>, D::Error>
where
    D: Deserializer<'de>,
{
    serde_aux::field_attributes::deserialize_bool_from_anything(deserializer).map(Some)
}

/// Options handed to the form parser.
///
/// Every field is optional so a set of caller options can be laid over the
/// defaults with [`FormOptions::merge`]. Keys this crate does not know about
/// are kept in `extra` and passed through to the parser untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct FormOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encoding: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upload_dir: Option<PathBuf>,
    #[serde(
        deserialize_with = "lenient_bool",
        skip_serializing_if = "Option::is_none"
    )]
    pub keep_extensions: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_fields_size: Option<SizeOption>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_file_size: Option<SizeOption>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl FormOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// The parser's own defaults.
    pub fn defaults() -> Self {
        Self {
            encoding: Some(DEFAULT_ENCODING.to_owned()),
            upload_dir: Some(PathBuf::from(DEFAULT_UPLOAD_DIR)),
            keep_extensions: Some(false),
            max_fields_size: Some(SizeOption::Bytes(DEFAULT_MAX_FIELDS_SIZE)),
            max_file_size: None,
            extra: BTreeMap::new(),
        }
    }

    /// Shallow merge: every key set in `overrides` replaces the same key in
    /// `defaults`.
    pub fn merge(defaults: FormOptions, overrides: FormOptions) -> FormOptions {
        let mut extra = defaults.extra;
        extra.extend(overrides.extra);

        FormOptions {
            encoding: overrides.encoding.or(defaults.encoding),
            upload_dir: overrides.upload_dir.or(defaults.upload_dir),
            keep_extensions: overrides.keep_extensions.or(defaults.keep_extensions),
            max_fields_size: overrides.max_fields_size.or(defaults.max_fields_size),
            max_file_size: overrides.max_file_size.or(defaults.max_file_size),
            extra,
        }
    }

    pub fn encoding(mut self, encoding: impl Into<String>) -> Self {
        self.encoding = Some(encoding.into());
        self
    }

    pub fn upload_dir(mut self, upload_dir: impl Into<PathBuf>) -> Self {
        self.upload_dir = Some(upload_dir.into());
        self
    }

    pub fn keep_extensions(mut self, keep_extensions: bool) -> Self {
        self.keep_extensions = Some(keep_extensions);
        self
    }

    pub fn max_fields_size(mut self, size: impl Into<SizeOption>) -> Self {
        self.max_fields_size = Some(size.into());
        self
    }

    pub fn max_file_size(mut self, size: impl Into<SizeOption>) -> Self {
        self.max_file_size = Some(size.into());
        self
    }

    /// Set a parser specific option that is passed through as is.
    pub fn set(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }
}

/// Validated parser configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct FormConfig {
    encoding: Encoding,
    upload_dir: PathBuf,
    keep_extensions: bool,
    max_fields_size: u64,
    max_file_size: Option<u64>,
    extra: BTreeMap<String, Value>,
}

impl FormConfig {
    /// Lay `overrides` over [`FormOptions::defaults`] and validate the result.
    pub fn from_overrides(overrides: FormOptions) -> Result<Self, FormError> {
        FormOptions::merge(FormOptions::defaults(), overrides).try_into()
    }

    pub fn encoding(&self) -> Encoding {
        self.encoding
    }

    pub fn upload_dir(&self) -> &Path {
        &self.upload_dir
    }

    pub fn keep_extensions(&self) -> bool {
        self.keep_extensions
    }

    pub fn max_fields_size(&self) -> u64 {
        self.max_fields_size
    }

    pub fn max_file_size(&self) -> Option<u64> {
        self.max_file_size
    }

    /// Parser specific options that were passed through unmodified.
    pub fn extra(&self) -> &BTreeMap<String, Value> {
        &self.extra
    }
}

impl Default for FormConfig {
    fn default() -> Self {
        Self {
            encoding: Encoding::Utf8,
            upload_dir: PathBuf::from(DEFAULT_UPLOAD_DIR),
            keep_extensions: false,
            max_fields_size: DEFAULT_MAX_FIELDS_SIZE,
            max_file_size: None,
            extra: BTreeMap::new(),
        }
    }
}

impl TryFrom<FormOptions> for FormConfig {
    type Error = FormError;

    fn try_from(options: FormOptions) -> Result<Self, Self::Error> {
        let defaults = FormConfig::default();

        let encoding = match options.encoding {
            Some(encoding) => encoding.parse()?,
            None => defaults.encoding,
        };

        let upload_dir = options.upload_dir.unwrap_or(defaults.upload_dir);
        if upload_dir.as_os_str().is_empty() {
            return Err(FormError::Config {
                key: "uploadDir",
                reason: "must not be empty".to_owned(),
            });
        }

        let max_fields_size = match options.max_fields_size {
            Some(size) => size.resolve("maxFieldsSize")?,
            None => defaults.max_fields_size,
        };

        let max_file_size = options
            .max_file_size
            .map(|size| size.resolve("maxFileSize"))
            .transpose()?;

        Ok(FormConfig {
            encoding,
            upload_dir,
            keep_extensions: options.keep_extensions.unwrap_or(defaults.keep_extensions),
            max_fields_size,
            max_file_size,
            extra: options.extra,
        })
    }
}
