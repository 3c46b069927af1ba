use std::{
    future::{ready, Ready},
    rc::Rc,
    sync::Arc,
};

use actix_web::{
    dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform},
    http::{header, header::HeaderMap, Method},
    Error, HttpMessage, HttpResponse,
};
use futures::future::LocalBoxFuture;
use tracing::{debug, warn};

use crate::{
    extractor::{handle_error, ErrorHandler},
    BodyParsed, CompletedForm, FormConfig, FormError, FormHandle, FormOptions, FormSession,
    IncomingForm,
};

const MULTIPART_FORM_DATA: &[u8] = b"multipart/form-data";

/// Whether a request should have its body parsed as a multipart form.
///
/// The content type is matched as a plain substring, so boundary and other
/// parameters after the media type are accepted.
pub fn is_form_request(method: &Method, headers: &HeaderMap, body_parsed: bool) -> bool {
    let content_type = match headers.get(header::CONTENT_TYPE) {
        Some(v) => v.as_bytes(),
        None => return false,
    };

    !body_parsed
        && (method == Method::POST || method == Method::PUT)
        && content_type
            .windows(MULTIPART_FORM_DATA.len())
            .any(|window| window == MULTIPART_FORM_DATA)
}

/// Middleware parsing multipart form submissions before they reach handlers.
///
/// Parsed text fields are stored in the request as [`crate::FormFields`],
/// uploads as [`crate::UploadedFiles`]; both can be extracted in handlers.
/// Parse errors resolve the request with a [`FormError`].
///
/// ```no_run
/// use actix_form_intercept::{FormFields, FormIntercept, FormOptions, UploadedFiles};
/// use actix_web::{web, App, HttpResponse};
///
/// async fn upload(fields: FormFields, files: UploadedFiles) -> HttpResponse {
///     HttpResponse::Ok().body(format!("{} fields, {} files", fields.len(), files.len()))
/// }
///
/// # fn main() -> Result<(), actix_form_intercept::FormError> {
/// let intercept = FormIntercept::new(FormOptions::new().keep_extensions(true))?;
/// let app = App::new()
///     .wrap(intercept)
///     .route("/upload", web::post().to(upload));
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Default)]
pub struct FormIntercept {
    config: FormConfig,
    deferred: bool,
    error_handler: Option<Arc<ErrorHandler>>,
}

impl FormIntercept {
    /// Build the middleware from caller options laid over the parser
    /// defaults. Invalid options are reported here, not per request.
    pub fn new(options: FormOptions) -> Result<Self, FormError> {
        Ok(Self::with_config(FormConfig::from_overrides(options)?))
    }

    /// Like [`FormIntercept::new`] with options given as JSON.
    pub fn from_value(options: serde_json::Value) -> Result<Self, FormError> {
        let options = serde_json::from_value(options).map_err(|err| FormError::Config {
            key: "options",
            reason: err.to_string(),
        })?;

        Self::new(options)
    }

    pub fn with_config(config: FormConfig) -> Self {
        Self {
            config,
            deferred: false,
            error_handler: None,
        }
    }

    /// Don't parse in the middleware. Handlers get the live form through
    /// [`FormHandle`] and finish it with [`FormHandle::complete`].
    pub fn deferred(mut self) -> Self {
        self.deferred = true;
        self
    }

    /// Build the error response for parse errors instead of the default
    /// [`FormError`] response.
    pub fn error_handler<F>(mut self, error_handler: F) -> Self
    where
        F: Fn(FormError) -> HttpResponse + Send + Sync + 'static,
    {
        self.error_handler = Some(Arc::new(error_handler));
        self
    }

    pub fn config(&self) -> &FormConfig {
        &self.config
    }
}

impl<S, B> Transform<S, ServiceRequest> for FormIntercept
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type Transform = FormInterceptMiddleware<S>;
    type InitError = ();
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(FormInterceptMiddleware {
            service: Rc::new(service),
            intercept: Rc::new(self.clone()),
        }))
    }
}

pub struct FormInterceptMiddleware<S> {
    service: Rc<S>,
    intercept: Rc<FormIntercept>,
}

impl<S, B> Service<ServiceRequest> for FormInterceptMiddleware<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, mut req: ServiceRequest) -> Self::Future {
        let body_parsed = req.extensions().contains::<BodyParsed>();
        if !is_form_request(req.method(), req.headers(), body_parsed) {
            return Box::pin(self.service.call(req));
        }

        debug!(
            method = %req.method(),
            path = req.path(),
            content_type = ?req.headers().get(header::CONTENT_TYPE),
            "intercepting multipart form"
        );

        let mut form = IncomingForm::new(self.intercept.config.clone());
        let payload = req.take_payload();
        form.parse(req.headers(), payload);

        let handle = FormHandle::new(form);
        req.extensions_mut().insert(handle.clone());

        if self.intercept.deferred {
            return Box::pin(self.service.call(req));
        }

        let service = Rc::clone(&self.service);
        let intercept = Rc::clone(&self.intercept);

        Box::pin(async move {
            let mut form = handle.take().ok_or(FormError::AlreadyConsumed)?;

            match FormSession::new().run(&mut form).await {
                Ok(CompletedForm { fields, files }) => {
                    debug!(fields = fields.len(), files = files.len(), "multipart form parsed");

                    {
                        let mut extensions = req.extensions_mut();
                        extensions.insert(fields);
                        extensions.insert(files);
                        extensions.insert(BodyParsed);
                    }

                    service.call(req).await
                }
                Err(err) => {
                    warn!(error = %err, "multipart form parse failed");
                    Err(handle_error(err, intercept.error_handler.as_deref()))
                }
            }
        })
    }
}
