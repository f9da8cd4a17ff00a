use hyper::{body, Client, StatusCode, Uri};

/// Run a GET with hyper on its own runtime, for cross checking what the
/// harness origin serves against a reference HTTP implementation
pub fn resolve_request(uri: Uri) -> Option<(StatusCode, String)> {
    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            println!("could not create a runtime: {e}");
            return None;
        }
    };
    runtime.block_on(async move {
        let client = Client::new();
        let response = match client.get(uri).await {
            Ok(response) => response,
            Err(e) => {
                println!("hyper request failed: {e}");
                return None;
            }
        };
        let status = response.status();
        let body = body::to_bytes(response.into_body()).await.ok()?;
        Some((status, String::from_utf8_lossy(&body).into_owned()))
    })
}
