use std::{
    collections::BTreeMap,
    mem,
    ops::Deref,
    path::PathBuf,
};

use serde::Serialize;
use tracing::trace;

use crate::{EngineFile, FormError, FormEvent, IncomingForm};

/// Marks a request whose body has already been consumed by some stage.
///
/// Inserted by the middleware once a form was parsed. Other body parsers
/// can insert it too so the form middleware leaves the request alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BodyParsed;

/// Value of a submitted field. A name sent once is a single value; sent
/// again, it becomes a list of every value in arrival order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum FieldValue {
    Single(String),
    Multiple(Vec<String>),
}

impl FieldValue {
    fn push(&mut self, value: String) {
        match self {
            FieldValue::Single(existing) => {
                let first = mem::take(existing);
                *self = FieldValue::Multiple(vec![first, value]);
            }
            FieldValue::Multiple(values) => values.push(value),
        }
    }

    pub fn as_single(&self) -> Option<&str> {
        match self {
            FieldValue::Single(value) => Some(value),
            FieldValue::Multiple(_) => None,
        }
    }

    /// All values, one element for a single value.
    pub fn values(&self) -> &[String] {
        match self {
            FieldValue::Single(value) => std::slice::from_ref(value),
            FieldValue::Multiple(values) => values,
        }
    }
}

/// Text fields of a parsed form, keyed by field name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct FormFields(BTreeMap<String, FieldValue>);

impl FormFields {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one occurrence of `key`.
    pub fn append(&mut self, key: String, value: String) {
        match self.0.get_mut(&key) {
            Some(existing) => existing.push(value),
            None => {
                self.0.insert(key, FieldValue::Single(value));
            }
        }
    }

    pub fn into_inner(self) -> BTreeMap<String, FieldValue> {
        self.0
    }
}

impl Deref for FormFields {
    type Target = BTreeMap<String, FieldValue>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// An uploaded file as seen by handlers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadedFile {
    /// Name of the multipart part the file arrived under.
    pub part_name: String,
    /// Where the parser stored the upload.
    pub path: PathBuf,
    /// Filename sent by the client.
    pub name: String,
    #[serde(rename = "type")]
    pub content_type: String,
}

impl UploadedFile {
    fn from_engine(part_name: String, file: EngineFile) -> Self {
        Self {
            part_name,
            path: file.path,
            name: file.name,
            content_type: file.content_type,
        }
    }
}

/// Uploaded files of a parsed form in arrival order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct UploadedFiles(Vec<UploadedFile>);

impl UploadedFiles {
    pub fn into_inner(self) -> Vec<UploadedFile> {
        self.0
    }
}

impl Deref for UploadedFiles {
    type Target = [UploadedFile];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// Result of a successfully parsed form.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompletedForm {
    pub fields: FormFields,
    pub files: UploadedFiles,
}

/// State of one form parse, fed by parser events.
///
/// Once a terminal event (end or error) was handled every later event is
/// ignored, so the collected fields and files can't change afterwards.
#[derive(Debug, Default)]
pub struct FormSession {
    fields: FormFields,
    files: Vec<UploadedFile>,
    terminated: bool,
}

impl FormSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    pub fn fields(&self) -> &FormFields {
        &self.fields
    }

    pub fn files(&self) -> &[UploadedFile] {
        &self.files
    }

    pub fn on_field(&mut self, key: String, value: String) {
        if self.terminated {
            return;
        }

        trace!(field = %key, "form field received");
        self.fields.append(key, value);
    }

    pub fn on_file(&mut self, part_name: String, file: EngineFile) {
        if self.terminated {
            return;
        }

        trace!(part = %part_name, path = %file.path.display(), size = file.size, "form file received");
        self.files.push(UploadedFile::from_engine(part_name, file));
    }

    /// Terminate with `error`. Returns the error to forward, or `None` if the
    /// session had already terminated.
    pub fn on_error(&mut self, error: FormError) -> Option<FormError> {
        if mem::replace(&mut self.terminated, true) {
            return None;
        }

        Some(error)
    }

    /// Terminate successfully, handing out the collected fields and files.
    pub fn on_end(&mut self) -> Option<CompletedForm> {
        if mem::replace(&mut self.terminated, true) {
            return None;
        }

        Some(CompletedForm {
            fields: mem::take(&mut self.fields),
            files: UploadedFiles(mem::take(&mut self.files)),
        })
    }

    /// Dispatch a parser event. Returns the outcome when the event ended
    /// the session.
    pub fn apply(&mut self, event: FormEvent) -> Option<Result<CompletedForm, FormError>> {
        match event {
            FormEvent::Field(key, value) => {
                self.on_field(key, value);
                None
            }
            FormEvent::File(part_name, file) => {
                self.on_file(part_name, file);
                None
            }
            FormEvent::Error(error) => self.on_error(error).map(Err),
            FormEvent::End => self.on_end().map(Ok),
        }
    }

    /// Pull events from `form` until it ends or fails.
    pub async fn run(mut self, form: &mut IncomingForm) -> Result<CompletedForm, FormError> {
        loop {
            if let Some(outcome) = self.apply(form.next_event().await) {
                return outcome;
            }
        }
    }
}
