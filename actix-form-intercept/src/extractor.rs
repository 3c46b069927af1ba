use actix_web::{
    dev::Payload,
    error::ErrorBadRequest,
    http::{header::ContentType, ConnectionType, StatusCode},
    FromRequest, HttpMessage, HttpRequest, HttpResponse, ResponseError,
};
use std::{
    cell::RefCell,
    future::{ready, Ready},
    rc::Rc,
};
use thiserror::Error;

use crate::{CompletedForm, Encoding, FormConfig, FormFields, FormSession, IncomingForm, UploadedFiles};

/// Error type for form parsing.
#[derive(Error, Debug)]
pub enum FormError {
    #[error("Invalid form option `{key}`: {reason}")]
    Config { key: &'static str, reason: String },
    /// Failure reported by the multipart stream, message kept as is.
    #[error("{0}")]
    Multipart(String),
    #[error("Error while storing upload: {0}")]
    Io(#[from] std::io::Error),
    #[error("File for field ({field}) was too large (max size: {limit} bytes)")]
    FileTooLarge { field: String, limit: u64 },
    #[error("Form fields were too large (max size: {limit} bytes)")]
    FieldsTooLarge { limit: u64 },
    #[error("Field ({field}) is not valid {encoding}")]
    Decode { field: String, encoding: Encoding },
    #[error("Form was already consumed")]
    AlreadyConsumed,
}

impl From<actix_multipart::MultipartError> for FormError {
    fn from(err: actix_multipart::MultipartError) -> Self {
        FormError::Multipart(err.to_string())
    }
}

impl ResponseError for FormError {
    fn status_code(&self) -> StatusCode {
        match self {
            FormError::Config { .. } | FormError::Io(_) | FormError::AlreadyConsumed => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            FormError::FileTooLarge { .. } | FormError::FieldsTooLarge { .. } => {
                StatusCode::PAYLOAD_TOO_LARGE
            }
            FormError::Multipart(_) | FormError::Decode { .. } => StatusCode::BAD_REQUEST,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let mut res = HttpResponse::build(self.status_code())
            .content_type(ContentType::plaintext())
            .body(self.to_string());

        close_connection(&mut res);
        res
    }
}

// We must do this manually because of a bug in actix_http, the rest of the
// body may still be unread when a form fails.
// SEE: https://github.com/actix/actix-web/pull/2779
fn close_connection(res: &mut HttpResponse) {
    res.head_mut().set_connection_type(ConnectionType::Close);
}

pub(crate) type ErrorHandler = dyn Fn(FormError) -> HttpResponse + Send + Sync + 'static;

/// Turn a parse error into the error the middleware resolves with.
pub(crate) fn handle_error(error: FormError, handler: Option<&ErrorHandler>) -> actix_web::Error {
    let error_handler = match handler {
        Some(error_handler) => error_handler,
        None => return error.into(),
    };

    let message = error.to_string();
    let mut res = error_handler(error);
    close_connection(&mut res);

    actix_web::error::InternalError::from_response(message, res).into()
}

/// The form parser attached to an intercepted request.
///
/// Available to handlers as soon as the middleware classified the request.
/// With [`crate::FormIntercept::deferred`] the form is left unparsed and
/// the handler finishes it with [`FormHandle::complete`]; otherwise the
/// middleware has already consumed it.
#[derive(Clone)]
pub struct FormHandle {
    config: FormConfig,
    form: Rc<RefCell<Option<IncomingForm>>>,
}

impl FormHandle {
    pub(crate) fn new(form: IncomingForm) -> Self {
        Self {
            config: form.config().clone(),
            form: Rc::new(RefCell::new(Some(form))),
        }
    }

    pub fn config(&self) -> &FormConfig {
        &self.config
    }

    pub fn is_consumed(&self) -> bool {
        self.form.borrow().is_none()
    }

    pub(crate) fn take(&self) -> Option<IncomingForm> {
        self.form.borrow_mut().take()
    }

    /// Parse the rest of the form and return its fields and files.
    pub async fn complete(&self) -> Result<CompletedForm, FormError> {
        let mut form = self.take().ok_or(FormError::AlreadyConsumed)?;
        FormSession::new().run(&mut form).await
    }
}

fn from_extensions<T: Clone + 'static>(req: &HttpRequest) -> Ready<Result<T, actix_web::Error>> {
    ready(
        req.extensions()
            .get::<T>()
            .cloned()
            .ok_or_else(|| ErrorBadRequest("request is not a parsed multipart form")),
    )
}

impl FromRequest for FormHandle {
    type Error = actix_web::Error;
    type Future = Ready<Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _: &mut Payload) -> Self::Future {
        from_extensions(req)
    }
}

impl FromRequest for FormFields {
    type Error = actix_web::Error;
    type Future = Ready<Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _: &mut Payload) -> Self::Future {
        from_extensions(req)
    }
}

impl FromRequest for UploadedFiles {
    type Error = actix_web::Error;
    type Future = Ready<Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _: &mut Payload) -> Self::Future {
        from_extensions(req)
    }
}
