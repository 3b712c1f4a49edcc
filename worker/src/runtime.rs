// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use bytes::Bytes;

use protocol::{InvocationResponse, InvocationSpec};

#[cfg(test)]
mod runtime_tests;

///
/// The function platform's invocation protocol: one pending job at a time, fetched with a
/// blocking GET and answered with a POST carrying the job's correlation id.
///
pub struct RuntimeClient {
    client: reqwest::Client,
    base: String,
}

const REQUEST_ID_HEADER: &str = "Lambda-Runtime-Aws-Request-Id";

pub struct NextJob {
    pub request_id: String,
    pub spec: InvocationSpec,
}

impl RuntimeClient {
    ///
    /// Build a client against the endpoint in `AWS_LAMBDA_RUNTIME_API` (a bare `host:port`).
    ///
    pub fn from_env() -> Result<RuntimeClient, String> {
        let api = std::env::var("AWS_LAMBDA_RUNTIME_API")
            .map_err(|_| "AWS_LAMBDA_RUNTIME_API is not set".to_owned())?;
        Ok(RuntimeClient::new(&format!("http://{api}")))
    }

    pub fn new(endpoint: &str) -> RuntimeClient {
        RuntimeClient {
            client: reqwest::Client::builder()
                // The next-invocation GET parks until work arrives, so never time it out.
                .build()
                .expect("default reqwest client"),
            base: format!("{}/2018-06-01/runtime", endpoint.trim_end_matches('/')),
        }
    }

    ///
    /// Block until the platform hands over the next job.
    ///
    pub async fn next(&self) -> Result<NextJob, String> {
        let response = self
            .client
            .get(format!("{}/invocation/next", self.base))
            .send()
            .await
            .map_err(|e| format!("fetching next invocation: {e}"))?;

        let request_id = response
            .headers()
            .get(REQUEST_ID_HEADER)
            .and_then(|value| value.to_str().ok())
            .ok_or_else(|| format!("next invocation carried no {REQUEST_ID_HEADER} header"))?
            .to_owned();

        let payload = response
            .bytes()
            .await
            .map_err(|e| format!("reading invocation payload: {e}"))?;
        let spec = serde_json::from_slice(&payload)
            .map_err(|e| format!("parsing invocation spec: {e}"))?;

        Ok(NextJob { request_id, spec })
    }

    pub async fn post_response(
        &self,
        request_id: &str,
        response: &InvocationResponse,
    ) -> Result<(), String> {
        let payload = serde_json::to_vec(response)
            .map_err(|e| format!("encoding invocation response: {e}"))?;
        self.post(
            &format!("{}/invocation/{request_id}/response", self.base),
            Bytes::from(payload),
        )
        .await
    }

    pub async fn post_error(&self, request_id: &str, message: &str) -> Result<(), String> {
        self.post(
            &format!("{}/invocation/{request_id}/error", self.base),
            error_payload(message),
        )
        .await
    }

    ///
    /// Report a boot failure: the platform tears the instance down afterwards.
    ///
    pub async fn post_init_error(&self, message: &str) -> Result<(), String> {
        self.post(&format!("{}/init/error", self.base), error_payload(message))
            .await
    }

    async fn post(&self, url: &str, payload: Bytes) -> Result<(), String> {
        let response = self
            .client
            .post(url)
            .body(payload)
            .send()
            .await
            .map_err(|e| format!("posting to {url}: {e}"))?;
        if !response.status().is_success() {
            return Err(format!("posting to {url}: status {}", response.status()));
        }
        Ok(())
    }
}

fn error_payload(message: &str) -> Bytes {
    let body = serde_json::json!({
        "errorMessage": message,
        "errorType": "InvocationError",
    });
    Bytes::from(serde_json::to_vec(&body).expect("error payload is serialisable"))
}
