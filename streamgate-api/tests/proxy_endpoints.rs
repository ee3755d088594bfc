//! End-to-end tests of the HTTP surface against a mock origin.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use tower::ServiceExt;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use streamgate_api::{create_router, AppState};
use streamgate_core::Config;
use streamgate_proxy::encode_query_value;

fn router() -> axum::Router {
    create_router(AppState::new(Config::default()))
}

fn router_with_password(password: &str) -> axum::Router {
    let mut config = Config::default();
    config.auth.api_password = Some(password.to_string());
    create_router(AppState::new(config))
}

async fn body_bytes(response: axum::response::Response) -> bytes::Bytes {
    response.into_body().collect().await.unwrap().to_bytes()
}

#[tokio::test]
async fn hls_proxy_rewrites_manifest_and_suppresses_ip_leak_headers() {
    let origin = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/pl.m3u8"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "application/vnd.apple.mpegurl")
                .set_body_string("#EXTM3U\n#EXTINF:6.0,\nseg1.ts\n"),
        )
        .mount(&origin)
        .await;

    let upstream = format!("{}/pl.m3u8", origin.uri());
    let uri = format!(
        "/proxy/hls/manifest.m3u8?d={}&h_X-Forwarded-For=1.2.3.4",
        encode_query_value(&upstream)
    );

    let response = router()
        .oneshot(
            Request::builder()
                .uri(uri)
                .header("X-Forwarded-For", "1.2.3.4")
                .header("X-Real-IP", "1.2.3.4")
                .header("Via", "1.1 edge")
                .header("Forwarded", "for=1.2.3.4")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = String::from_utf8(body_bytes(response).await.to_vec()).unwrap();
    assert!(body.contains("/proxy/stream?d="), "not rewritten: {body}");
    assert!(body.contains(&encode_query_value(&format!("{}/seg1.ts", origin.uri()))));

    // The upstream request must carry none of the IP-revealing headers,
    // regardless of client headers or h_* parameters.
    let requests = origin.received_requests().await.unwrap();
    assert_eq!(requests.len(), 1);
    for name in ["x-forwarded-for", "x-real-ip", "forwarded", "via"] {
        assert!(
            requests[0].headers.get(name).is_none(),
            "{name} leaked upstream"
        );
    }
    assert!(requests[0].headers.get("user-agent").is_some());
}

#[tokio::test]
async fn masked_css_playlist_is_detected_and_rewritten() {
    let origin = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/mono.css"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/css")
                .set_body_string("#EXTM3U\n#EXTINF:2.0,\nchunk.ts\n"),
        )
        .mount(&origin)
        .await;

    let upstream = format!("{}/mono.css", origin.uri());
    let uri = format!("/proxy/hls/manifest.m3u8?d={}", encode_query_value(&upstream));

    let response = router()
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()["content-type"],
        "application/vnd.apple.mpegurl"
    );
    let body = String::from_utf8(body_bytes(response).await.to_vec()).unwrap();
    assert!(body.contains("/proxy/stream?d="));
}

#[tokio::test]
async fn upstream_error_status_and_body_are_relayed() {
    let origin = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/gone.m3u8"))
        .respond_with(ResponseTemplate::new(404).set_body_string("channel expired"))
        .mount(&origin)
        .await;

    let upstream = format!("{}/gone.m3u8", origin.uri());
    let uri = format!("/proxy/hls/manifest.m3u8?d={}", encode_query_value(&upstream));

    let response = router()
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(&body_bytes(response).await[..], b"channel expired");
}

#[tokio::test]
async fn mpd_is_converted_to_hls_master_and_media() {
    let manifest = r#"<?xml version="1.0" encoding="UTF-8"?>
<MPD xmlns="urn:mpeg:dash:schema:mpd:2011" type="static">
  <Period duration="PT8S">
    <AdaptationSet mimeType="video/mp4">
      <SegmentTemplate timescale="1" duration="4" initialization="init.mp4"
                       media="seg-$Number$.m4s" startNumber="1"/>
      <Representation id="v1" bandwidth="900000" width="640" height="360"/>
    </AdaptationSet>
  </Period>
</MPD>"#;

    let origin = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/stream.mpd"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "application/dash+xml")
                .set_body_string(manifest),
        )
        .mount(&origin)
        .await;

    let upstream = format!("{}/stream.mpd", origin.uri());

    let master_uri = format!("/proxy/mpd/manifest.m3u8?d={}", encode_query_value(&upstream));
    let response = router()
        .oneshot(Request::builder().uri(master_uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let master = String::from_utf8(body_bytes(response).await.to_vec()).unwrap();
    assert!(master.contains("#EXT-X-STREAM-INF:BANDWIDTH=900000,RESOLUTION=640x360"));
    assert!(master.contains("rep_id=v1"));

    let media_uri = format!(
        "/proxy/mpd/manifest.m3u8?d={}&rep_id=v1",
        encode_query_value(&upstream)
    );
    let response = router()
        .oneshot(Request::builder().uri(media_uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let media = String::from_utf8(body_bytes(response).await.to_vec()).unwrap();
    assert!(media.contains("#EXT-X-MAP:URI="));
    assert!(media.contains("/segment/seg-1.m4s?base_url="));
    assert!(media.contains("#EXT-X-ENDLIST"));
}

#[tokio::test]
async fn segment_relay_forces_ts_content_type() {
    let origin = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v/seg1.ts"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "application/octet-stream")
                .set_body_bytes(vec![0x47u8; 188]),
        )
        .mount(&origin)
        .await;

    let base = format!("{}/v/", origin.uri());
    let uri = format!("/segment/seg1.ts?base_url={}", encode_query_value(&base));

    let response = router()
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["content-type"], "video/MP2T");
    assert_eq!(
        response.headers()["content-disposition"],
        "attachment; filename=\"seg1.ts\""
    );
    assert_eq!(body_bytes(response).await.len(), 188);
}

#[tokio::test]
async fn static_key_is_served_as_raw_bytes() {
    let response = router()
        .oneshot(
            Request::builder()
                .uri("/key?static_key=00112233")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()["content-type"],
        "application/octet-stream"
    );
    assert_eq!(&body_bytes(response).await[..], &[0x00, 0x11, 0x22, 0x33]);
}

#[tokio::test]
async fn clearkey_license_synthesizes_jwk_set() {
    let response = router()
        .oneshot(
            Request::builder()
                .uri("/license?clearkey=00112233445566778899aabbccddeeff:ffeeddccbbaa99887766554433221100")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json: serde_json::Value =
        serde_json::from_slice(&body_bytes(response).await).unwrap();
    assert_eq!(json["type"], "temporary");
    assert_eq!(json["keys"][0]["kty"], "oct");
    assert_eq!(json["keys"][0]["kid"], "ABEiM0RVZneImaq7zN3u_w");
}

#[tokio::test]
async fn decrypt_requires_url_key_and_key_id() {
    let response = router()
        .oneshot(
            Request::builder()
                .uri("/decrypt/segment.mp4?url=https%3A%2F%2Fo.example%2Fs.m4s")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn configured_password_gates_endpoints() {
    let response = router_with_password("pw")
        .oneshot(
            Request::builder()
                .uri("/key?static_key=00ff")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = router_with_password("pw")
        .oneshot(
            Request::builder()
                .uri("/key?static_key=00ff&api_password=pw")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = router_with_password("pw")
        .oneshot(
            Request::builder()
                .uri("/key?static_key=00ff")
                .header("x-api-password", "pw")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn generate_urls_builds_proxy_urls_with_headers() {
    let payload = serde_json::json!({
        "urls": [{
            "destination_url": "https://o.example/live/pl.m3u8",
            "endpoint": "/proxy/hls/manifest.m3u8",
            "request_headers": {"referer": "https://o.example/"}
        }]
    });

    let response = router()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/generate_urls")
                .header("content-type", "application/json")
                .header("host", "proxy.example")
                .body(Body::from(payload.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json: serde_json::Value =
        serde_json::from_slice(&body_bytes(response).await).unwrap();
    let url = json["urls"][0].as_str().unwrap();
    assert!(url.starts_with("http://proxy.example/proxy/hls/manifest.m3u8?d="));
    assert!(url.contains("h_referer=https%3A%2F%2Fo.example%2F"));
}

#[tokio::test]
async fn extractor_endpoint_returns_descriptor_json() {
    let response = router()
        .oneshot(
            Request::builder()
                .uri(format!(
                    "/extractor/video?url={}",
                    encode_query_value("https://o.example/live/pl.m3u8")
                ))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json: serde_json::Value =
        serde_json::from_slice(&body_bytes(response).await).unwrap();
    assert_eq!(json["destination_url"], "https://o.example/live/pl.m3u8");
    assert_eq!(json["endpoint_kind"], "hls_proxy");
    assert!(json["proxy_url"]
        .as_str()
        .unwrap()
        .ends_with("/proxy/hls/manifest.m3u8"));
}
