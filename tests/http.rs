use axum::{Router, body::Body, http::Request, response::Response};
use chunk_share::{
    db,
    routes::routes::build_app,
    services::{
        block_store::{LocalBlockStore, UrlSigner},
        upload_coordinator::CoordinatorSettings,
    },
    state::AppState,
};
use http_body_util::BodyExt;
use serde_json::{Value, json};
use std::sync::Arc;
use tower::ServiceExt;
use uuid::Uuid;

const PUBLIC_URL: &str = "http://localhost:3000";
const BOUNDARY: &str = "chunk-share-test-boundary";

async fn app() -> Router {
    let db = db::connect_in_memory().await.unwrap();
    let root = std::env::temp_dir().join(format!("chunk-share-http-{}", Uuid::new_v4()));
    std::fs::create_dir_all(&root).unwrap();
    let store = Arc::new(LocalBlockStore::new(root, UrlSigner::new(PUBLIC_URL, "test-key")));
    let state = AppState::new(db, store, CoordinatorSettings::new("snappshare"));
    build_app(state, 1024 * 1024)
}

async fn json_body(res: Response) -> Value {
    let bytes = res.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

fn multipart(fields: &[(&str, &str)], chunk: Option<&[u8]>) -> Body {
    let mut body = Vec::new();
    for (name, value) in fields {
        body.extend_from_slice(
            format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n"
            )
            .as_bytes(),
        );
    }
    if let Some(chunk) = chunk {
        body.extend_from_slice(
            format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"chunkFile\"; filename=\"blob\"\r\nContent-Type: application/octet-stream\r\n\r\n"
            )
            .as_bytes(),
        );
        body.extend_from_slice(chunk);
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
    Body::from(body)
}

fn post_multipart(uri: &str, body: Body) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(
            "content-type",
            format!("multipart/form-data; boundary={BOUNDARY}"),
        )
        .body(body)
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder()
        .method("GET")
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

fn handle_upload_request(index: &str, chunk: &[u8]) -> Request<Body> {
    post_multipart(
        "/file-entry/handle-upload",
        multipart(
            &[
                ("fileName", "report.pdf"),
                ("fileHash", "h1"),
                ("fileSize", "11"),
                ("chunkIndex", index),
                ("totalChunks", "2"),
                ("chunkHash", "c"),
                ("expiresIn", "OneDay"),
            ],
            Some(chunk),
        ),
    )
}

#[tokio::test]
async fn health_and_readiness() {
    let app = app().await;

    let res = app.clone().oneshot(get("/healthz")).await.unwrap();
    assert_eq!(res.status().as_u16(), 200);
    assert_eq!(json_body(res).await["status"], "ok");

    let res = app.oneshot(get("/readyz")).await.unwrap();
    assert_eq!(res.status().as_u16(), 200);
    let body = json_body(res).await;
    assert_eq!(body["checks"]["sqlite"]["ok"], json!(true));
    assert_eq!(body["checks"]["storage"]["ok"], json!(true));
}

#[tokio::test]
async fn chunked_upload_finalizes_and_downloads() {
    let app = app().await;

    let res = app
        .clone()
        .oneshot(handle_upload_request("0", b"hello "))
        .await
        .unwrap();
    assert_eq!(res.status().as_u16(), 200);
    let first = json_body(res).await;
    assert_eq!(first["status"], "SUCCESS");
    assert_eq!(first["uploadedChunk"], 0);
    let file_id = first["fileId"].as_str().unwrap().to_string();

    let res = app
        .clone()
        .oneshot(get(&format!("/file-entry/{file_id}")))
        .await
        .unwrap();
    let progress = json_body(res).await;
    assert_eq!(progress["status"], "PARTIAL");
    assert_eq!(progress["uploadedChunks"], json!([0]));
    assert_eq!(progress["totalChunks"], 2);

    let res = app
        .clone()
        .oneshot(handle_upload_request("1", b"world"))
        .await
        .unwrap();
    let done = json_body(res).await;
    assert_eq!(done["status"], "COMPLETE");
    assert_eq!(done["fileId"], file_id.as_str());
    let file_url = done["fileUrl"].as_str().unwrap();
    let path = file_url.strip_prefix(PUBLIC_URL).unwrap();

    let res = app.clone().oneshot(get(path)).await.unwrap();
    assert_eq!(res.status().as_u16(), 200);
    assert_eq!(
        res.headers()["content-disposition"],
        "attachment; filename=\"report.pdf\""
    );
    let bytes = res.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&bytes[..], b"hello world");

    let tampered = path.replace("signature=", "signature=0");
    let res = app.clone().oneshot(get(&tampered)).await.unwrap();
    assert_eq!(res.status().as_u16(), 403);

    let res = app
        .oneshot(get(&format!("/blobs/snappshare/{file_id}/report.pdf")))
        .await
        .unwrap();
    assert_eq!(res.status().as_u16(), 403);
}

#[tokio::test]
async fn create_then_poll_and_finalize() {
    let app = app().await;

    let res = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/file-entry/create")
                .header("content-type", "application/json")
                .body(Body::from(
                    json!({
                        "fileName": "a.txt",
                        "fileHash": "ha",
                        "fileSize": 4,
                        "totalChunks": 2,
                        "expiresIn": 60
                    })
                    .to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(res.status().as_u16(), 200);
    let entry = json_body(res).await;
    assert_eq!(entry["status"], "pending");
    assert_eq!(entry["fileUrl"], Value::Null);
    let file_id = entry["id"].as_str().unwrap().to_string();

    let res = app
        .clone()
        .oneshot(get(&format!("/file-entry/{file_id}")))
        .await
        .unwrap();
    assert_eq!(json_body(res).await["status"], "NEW");

    let res = app
        .clone()
        .oneshot(post_multipart(
            &format!("/file-entry/{file_id}/upload"),
            multipart(
                &[
                    ("fileName", "a.txt"),
                    ("fileHash", "ha"),
                    ("chunkIndex", "1"),
                    ("totalChunks", "2"),
                    ("chunkHash", "c1"),
                ],
                Some(b"cd"),
            ),
        ))
        .await
        .unwrap();
    assert_eq!(json_body(res).await["status"], "SUCCESS");

    let finalize = || {
        Request::builder()
            .method("POST")
            .uri(format!("/file-entry/{file_id}/finalize"))
            .body(Body::empty())
            .unwrap()
    };
    let res = app.clone().oneshot(finalize()).await.unwrap();
    assert_eq!(res.status().as_u16(), 200);
    let partial = json_body(res).await;
    assert_eq!(partial["status"], "PARTIAL");
    assert_eq!(partial["uploadedChunks"], json!([1]));

    let res = app
        .clone()
        .oneshot(post_multipart(
            &format!("/file-entry/{file_id}/upload"),
            multipart(
                &[
                    ("fileName", "a.txt"),
                    ("fileHash", "ha"),
                    ("chunkIndex", "0"),
                    ("totalChunks", "2"),
                    ("chunkHash", "c0"),
                ],
                Some(b"ab"),
            ),
        ))
        .await
        .unwrap();
    assert_eq!(json_body(res).await["status"], "SUCCESS");

    let res = app.clone().oneshot(finalize()).await.unwrap();
    let complete = json_body(res).await;
    assert_eq!(complete["status"], "COMPLETE");
    let again = json_body(app.oneshot(finalize()).await.unwrap()).await;
    assert_eq!(again["fileUrl"], complete["fileUrl"]);
}

#[tokio::test]
async fn invalid_requests_map_to_client_errors() {
    let app = app().await;

    let res = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/file-entry/create")
                .header("content-type", "application/json")
                .body(Body::from(
                    json!({
                        "fileName": "a.txt",
                        "fileHash": "hx",
                        "fileSize": 4,
                        "totalChunks": 2,
                        "expiresIn": "Fortnight"
                    })
                    .to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(res.status().as_u16(), 400);
    let body = json_body(res).await;
    assert_eq!(body["status"], 400);
    assert!(body["error"].as_str().unwrap().contains("expiresIn"));

    let res = app
        .clone()
        .oneshot(post_multipart(
            "/file-entry/handle-upload",
            multipart(&[("fileName", "a.txt")], Some(b"x")),
        ))
        .await
        .unwrap();
    assert_eq!(res.status().as_u16(), 400);

    let res = app
        .clone()
        .oneshot(handle_upload_request("-1", b"x"))
        .await
        .unwrap();
    assert_eq!(res.status().as_u16(), 400);

    let res = app.clone().oneshot(get("/file-entry/missing")).await.unwrap();
    assert_eq!(res.status().as_u16(), 404);

    let res = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/file-entry/missing/finalize")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(res.status().as_u16(), 404);
}

fn share_form(fields: &[(&str, &str)], file: Option<(&str, &[u8])>) -> Body {
    let mut body = Vec::new();
    for (name, value) in fields {
        body.extend_from_slice(
            format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n"
            )
            .as_bytes(),
        );
    }
    if let Some((file_name, bytes)) = file {
        body.extend_from_slice(
            format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"{file_name}\"\r\nContent-Type: application/octet-stream\r\n\r\n"
            )
            .as_bytes(),
        );
        body.extend_from_slice(bytes);
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
    Body::from(body)
}

#[tokio::test]
async fn single_shot_share_round_trip() {
    let app = app().await;

    let res = app
        .clone()
        .oneshot(post_multipart(
            "/file/upload",
            share_form(&[("ExpiryDuration", "OneHour")], Some(("notes.txt", &b"remember"[..]))),
        ))
        .await
        .unwrap();
    assert_eq!(res.status().as_u16(), 200);
    let receipt = json_body(res).await;
    let id = receipt["id"].as_str().unwrap().to_string();
    assert_eq!(id.len(), 6);
    assert_eq!(receipt["expiryDuration"], "Expires in 1 hour");
    assert_eq!(receipt["fileAccessUrl"], format!("{PUBLIC_URL}/file/{id}"));

    let res = app.clone().oneshot(get(&format!("/file/{id}"))).await.unwrap();
    assert_eq!(res.status().as_u16(), 200);
    let details = json_body(res).await;
    assert!(details["expiresAt"].is_string());
    assert!(details["createdAt"].is_string());
    let url = details["originalUrl"].as_str().unwrap();
    let path = url.strip_prefix(PUBLIC_URL).unwrap();

    let res = app.clone().oneshot(get(path)).await.unwrap();
    assert_eq!(res.status().as_u16(), 200);
    assert_eq!(
        res.headers()["content-disposition"],
        "attachment; filename=\"notes.txt\""
    );
    let bytes = res.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&bytes[..], b"remember");

    let res = app
        .clone()
        .oneshot(post_multipart(
            "/file/upload",
            share_form(
                &[("note", "call the office before noon"), ("ExpiryDuration", "5")],
                None,
            ),
        ))
        .await
        .unwrap();
    assert_eq!(res.status().as_u16(), 200);
    let note_id = json_body(res).await["id"].as_str().unwrap().to_string();
    let details = json_body(app.oneshot(get(&format!("/file/{note_id}"))).await.unwrap()).await;
    assert_eq!(details["note"], "call the office before noon");
    assert_eq!(details["originalUrl"], Value::Null);
}

#[tokio::test]
async fn invalid_shares_are_rejected() {
    let app = app().await;

    for body in [
        share_form(&[("ExpiryDuration", "OneHour")], None),
        share_form(&[("ExpiryDuration", "OneHour")], Some(("tool.exe", &b"MZ"[..]))),
        share_form(&[("note", "too short"), ("ExpiryDuration", "OneHour")], None),
        share_form(&[], Some(("a.txt", &b"x"[..]))),
        share_form(&[("ExpiryDuration", "Fortnight")], Some(("a.txt", &b"x"[..]))),
    ] {
        let res = app
            .clone()
            .oneshot(post_multipart("/file/upload", body))
            .await
            .unwrap();
        assert_eq!(res.status().as_u16(), 400);
    }

    let res = app.oneshot(get("/file/abc123")).await.unwrap();
    assert_eq!(res.status().as_u16(), 404);
}
