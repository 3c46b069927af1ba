use std::path::{Path, PathBuf};

use actix_form_intercept::{
    BodyParsed, FormError, FormFields, FormHandle, FormIntercept, FormOptions, UploadedFiles,
};
use actix_web::{
    dev::Service,
    http::{header, ConnectionType, StatusCode},
    test, web, App, HttpMessage, HttpRequest, HttpResponse,
};
use serde_json::{json, Value};
use uuid::Uuid;

const BOUNDARY: &str = "----intercept7MA4YWxkTrZu0gW";

enum Part<'a> {
    Field(&'a str, &'a [u8]),
    File(&'a str, &'a str, &'a str, &'a [u8]),
}

fn multipart_body(parts: &[Part]) -> Vec<u8> {
    let mut body = Vec::new();

    for part in parts {
        body.extend_from_slice(format!("--{}\r\n", BOUNDARY).as_bytes());
        match part {
            Part::Field(name, value) => {
                body.extend_from_slice(
                    format!("Content-Disposition: form-data; name=\"{}\"\r\n\r\n", name)
                        .as_bytes(),
                );
                body.extend_from_slice(value);
            }
            Part::File(name, filename, content_type, data) => {
                body.extend_from_slice(
                    format!(
                        "Content-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\nContent-Type: {}\r\n\r\n",
                        name, filename, content_type
                    )
                    .as_bytes(),
                );
                body.extend_from_slice(data);
            }
        }
        body.extend_from_slice(b"\r\n");
    }

    body.extend_from_slice(format!("--{}--\r\n", BOUNDARY).as_bytes());
    body
}

fn form_request(parts: &[Part]) -> test::TestRequest {
    test::TestRequest::post()
        .uri("/")
        .insert_header((
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={}", BOUNDARY),
        ))
        .set_payload(multipart_body(parts))
}

/// Upload directory removed when the test ends.
struct UploadDir(PathBuf);

impl UploadDir {
    fn new() -> Self {
        Self(std::env::temp_dir().join(format!("form-intercept-{}", Uuid::new_v4().simple())))
    }

    fn path(&self) -> &Path {
        &self.0
    }

    fn entries(&self) -> usize {
        std::fs::read_dir(&self.0).map(|dir| dir.count()).unwrap_or(0)
    }
}

impl Drop for UploadDir {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.0);
    }
}

async fn echo(fields: FormFields, files: UploadedFiles) -> HttpResponse {
    HttpResponse::Ok().json(json!({ "body": fields, "uploaded_files": files }))
}

async fn inspect(req: HttpRequest, handle: Option<FormHandle>, body: web::Bytes) -> HttpResponse {
    let extensions = req.extensions();

    HttpResponse::Ok().json(json!({
        "form_consumed": handle.map(|handle| handle.is_consumed()),
        "body": extensions.get::<FormFields>().is_some(),
        "uploaded_files": extensions.get::<UploadedFiles>().is_some(),
        "raw": String::from_utf8_lossy(&body),
    }))
}

async fn complete_later(handle: FormHandle) -> Result<HttpResponse, FormError> {
    let form = handle.complete().await?;
    let again = matches!(handle.complete().await, Err(FormError::AlreadyConsumed));

    Ok(HttpResponse::Ok().json(json!({
        "body": form.fields,
        "uploaded_files": form.files,
        "completed_twice": !again,
    })))
}

#[actix_web::test]
async fn parses_fields_and_files() {
    let dir = UploadDir::new();
    let app = test::init_service(
        App::new()
            .wrap(FormIntercept::new(FormOptions::new().upload_dir(dir.path())).unwrap())
            .default_service(web::to(echo)),
    )
    .await;

    let req = form_request(&[
        Part::Field("name", b"Alice"),
        Part::Field("tags", b"red"),
        Part::File("file1", "photo.jpg", "image/jpeg", b"\xff\xd8\xff\xe0jpeg"),
        Part::Field("tags", b"blue"),
    ])
    .to_request();

    let res: Value = test::call_and_read_body_json(&app, req).await;

    assert_eq!(res["body"], json!({ "name": "Alice", "tags": ["red", "blue"] }));

    let files = res["uploaded_files"].as_array().unwrap();
    assert_eq!(files.len(), 1);
    assert_eq!(files[0]["partName"], "file1");
    assert_eq!(files[0]["name"], "photo.jpg");
    assert_eq!(files[0]["type"], "image/jpeg");

    let path = PathBuf::from(files[0]["path"].as_str().unwrap());
    assert_eq!(path.parent(), Some(dir.path()));
    assert_eq!(path.extension(), None);
    assert_eq!(std::fs::read(&path).unwrap(), b"\xff\xd8\xff\xe0jpeg");
}

#[actix_web::test]
async fn repeated_fields_collect_in_order() {
    let app = test::init_service(
        App::new()
            .wrap(FormIntercept::default())
            .default_service(web::to(echo)),
    )
    .await;

    let req = form_request(&[
        Part::Field("a", b"x"),
        Part::Field("a", b"y"),
        Part::Field("a", b"z"),
        Part::Field("b", b"only"),
    ])
    .to_request();

    let res: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(res["body"], json!({ "a": ["x", "y", "z"], "b": "only" }));
    assert_eq!(res["uploaded_files"], json!([]));
}

#[actix_web::test]
async fn files_are_listed_in_arrival_order() {
    let dir = UploadDir::new();
    let app = test::init_service(
        App::new()
            .wrap(
                FormIntercept::new(FormOptions::new().upload_dir(dir.path()).keep_extensions(true))
                    .unwrap(),
            )
            .default_service(web::to(echo)),
    )
    .await;

    let req = test::TestRequest::put()
        .uri("/")
        .insert_header((
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={}", BOUNDARY),
        ))
        .set_payload(multipart_body(&[
            Part::File("docs", "b.txt", "text/plain", b"second"),
            Part::File("docs", "a.png", "image/png", b"first"),
        ]))
        .to_request();

    let res: Value = test::call_and_read_body_json(&app, req).await;
    let files = res["uploaded_files"].as_array().unwrap();

    let names: Vec<_> = files.iter().map(|file| file["name"].as_str().unwrap()).collect();
    assert_eq!(names, ["b.txt", "a.png"]);
    assert!(files[0]["path"].as_str().unwrap().ends_with(".txt"));
    assert!(files[1]["path"].as_str().unwrap().ends_with(".png"));
    assert_eq!(dir.entries(), 2);
}

#[actix_web::test]
async fn non_form_requests_pass_through_untouched() {
    let app = test::init_service(
        App::new()
            .wrap(FormIntercept::default())
            .default_service(web::to(inspect)),
    )
    .await;

    let json_post = test::TestRequest::post()
        .uri("/")
        .insert_header((header::CONTENT_TYPE, "application/json"))
        .set_payload(r#"{"a":1}"#)
        .to_request();
    let res: Value = test::call_and_read_body_json(&app, json_post).await;
    assert_eq!(
        res,
        json!({ "form_consumed": null, "body": false, "uploaded_files": false, "raw": r#"{"a":1}"# })
    );

    // Multipart content type, but not a POST or PUT
    for _ in 0..2 {
        let patch = test::TestRequest::patch()
            .uri("/")
            .insert_header((
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={}", BOUNDARY),
            ))
            .to_request();
        let res: Value = test::call_and_read_body_json(&app, patch).await;
        assert_eq!(res["form_consumed"], Value::Null);
        assert_eq!(res["body"], false);
    }

    let no_content_type = test::TestRequest::post().uri("/").to_request();
    let res: Value = test::call_and_read_body_json(&app, no_content_type).await;
    assert_eq!(res["body"], false);
}

#[actix_web::test]
async fn already_parsed_body_passes_through() {
    let app = test::init_service(
        App::new()
            .wrap(FormIntercept::default())
            .wrap_fn(|req, srv| {
                req.extensions_mut().insert(BodyParsed);
                srv.call(req)
            })
            .default_service(web::to(inspect)),
    )
    .await;

    let req = form_request(&[Part::Field("a", b"x")]).to_request();
    let res: Value = test::call_and_read_body_json(&app, req).await;

    assert_eq!(res["form_consumed"], Value::Null);
    assert_eq!(res["body"], false);
    assert_eq!(res["uploaded_files"], false);
}

#[actix_web::test]
async fn eager_mode_leaves_a_consumed_handle() {
    let app = test::init_service(
        App::new()
            .wrap(FormIntercept::default())
            .default_service(web::to(inspect)),
    )
    .await;

    let req = form_request(&[Part::Field("a", b"x")]).to_request();
    let res: Value = test::call_and_read_body_json(&app, req).await;

    assert_eq!(res["form_consumed"], true);
    assert_eq!(res["body"], true);
    assert_eq!(res["uploaded_files"], true);
}

#[actix_web::test]
async fn deferred_mode_completes_in_handler() {
    let dir = UploadDir::new();
    let app = test::init_service(
        App::new()
            .wrap(
                FormIntercept::new(FormOptions::new().upload_dir(dir.path()))
                    .unwrap()
                    .deferred(),
            )
            .default_service(web::to(complete_later)),
    )
    .await;

    let req = form_request(&[
        Part::Field("name", b"Alice"),
        Part::File("file1", "photo.jpg", "image/jpeg", b"jpeg"),
    ])
    .to_request();
    let res: Value = test::call_and_read_body_json(&app, req).await;

    assert_eq!(res["body"], json!({ "name": "Alice" }));
    assert_eq!(res["uploaded_files"][0]["partName"], "file1");
    assert_eq!(res["completed_twice"], false);
}

#[actix_web::test]
async fn parse_errors_are_forwarded() {
    let app = test::init_service(
        App::new()
            .wrap(FormIntercept::default())
            .default_service(web::to(echo)),
    )
    .await;

    // No boundary parameter, the multipart stream can't be read
    let req = test::TestRequest::post()
        .uri("/")
        .insert_header((header::CONTENT_TYPE, "multipart/form-data"))
        .set_payload("irrelevant")
        .to_request();

    let err = match app.call(req).await {
        Ok(_) => panic!("expected the form to fail"),
        Err(err) => err,
    };

    let form_err = err.as_error::<FormError>().unwrap();
    assert!(matches!(form_err, FormError::Multipart(_)));
    assert_eq!(err.error_response().status(), StatusCode::BAD_REQUEST);
}

#[actix_web::test]
async fn truncated_form_closes_the_connection() {
    let app = test::init_service(
        App::new()
            .wrap(FormIntercept::default())
            .default_service(web::to(echo)),
    )
    .await;

    // One field and no closing delimiter
    let body = format!(
        "--{}\r\nContent-Disposition: form-data; name=\"a\"\r\n\r\nx",
        BOUNDARY
    );
    let req = test::TestRequest::post()
        .uri("/")
        .insert_header((
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={}", BOUNDARY),
        ))
        .set_payload(body)
        .to_request();

    let err = match app.call(req).await {
        Ok(_) => panic!("expected the truncated form to fail"),
        Err(err) => err,
    };

    assert!(matches!(
        err.as_error::<FormError>(),
        Some(FormError::Multipart(_))
    ));

    let res = err.error_response();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    assert_eq!(res.head().connection_type(), ConnectionType::Close);
}

#[actix_web::test]
async fn oversized_file_is_rejected_and_removed() {
    let dir = UploadDir::new();
    let app = test::init_service(
        App::new()
            .wrap(
                FormIntercept::new(
                    FormOptions::new()
                        .upload_dir(dir.path())
                        .max_file_size(4u64),
                )
                .unwrap(),
            )
            .default_service(web::to(echo)),
    )
    .await;

    let req = form_request(&[Part::File("file1", "big.bin", "application/octet-stream", b"0123456789")])
        .to_request();

    let err = match app.call(req).await {
        Ok(_) => panic!("expected the upload to be rejected"),
        Err(err) => err,
    };

    assert_eq!(
        err.to_string(),
        "File for field (file1) was too large (max size: 4 bytes)"
    );
    assert_eq!(err.error_response().status(), StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(dir.entries(), 0);
}

#[actix_web::test]
async fn oversized_fields_are_rejected() {
    let app = test::init_service(
        App::new()
            .wrap(FormIntercept::new(FormOptions::new().max_fields_size(8u64)).unwrap())
            .default_service(web::to(echo)),
    )
    .await;

    let req = form_request(&[Part::Field("a", b"12345"), Part::Field("b", b"67890")]).to_request();

    let err = match app.call(req).await {
        Ok(_) => panic!("expected the fields to be rejected"),
        Err(err) => err,
    };

    assert!(matches!(
        err.as_error::<FormError>(),
        Some(FormError::FieldsTooLarge { limit: 8 })
    ));
}

#[actix_web::test]
async fn custom_error_handler_builds_the_response() {
    let app = test::init_service(
        App::new()
            .wrap(
                FormIntercept::default()
                    .error_handler(|err| HttpResponse::UnprocessableEntity().body(err.to_string())),
            )
            .default_service(web::to(echo)),
    )
    .await;

    let req = test::TestRequest::post()
        .uri("/")
        .insert_header((header::CONTENT_TYPE, "multipart/form-data"))
        .to_request();

    let err = match app.call(req).await {
        Ok(_) => panic!("expected the form to fail"),
        Err(err) => err,
    };

    assert_eq!(err.error_response().status(), StatusCode::UNPROCESSABLE_ENTITY);
}

#[actix_web::test]
async fn fields_are_decoded_with_configured_encoding() {
    let app = test::init_service(
        App::new()
            .wrap(FormIntercept::from_value(json!({ "encoding": "latin1" })).unwrap())
            .default_service(web::to(echo)),
    )
    .await;

    let req = form_request(&[Part::Field("city", b"Z\xfcrich")]).to_request();
    let res: Value = test::call_and_read_body_json(&app, req).await;

    assert_eq!(res["body"]["city"], "Zürich");
}

#[actix_web::test]
async fn invalid_utf8_is_a_parse_error() {
    let app = test::init_service(
        App::new()
            .wrap(FormIntercept::default())
            .default_service(web::to(echo)),
    )
    .await;

    let req = form_request(&[Part::Field("city", b"Z\xfcrich")]).to_request();

    let err = match app.call(req).await {
        Ok(_) => panic!("expected decoding to fail"),
        Err(err) => err,
    };

    assert_eq!(err.to_string(), "Field (city) is not valid utf8");
}
