// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use async_trait::async_trait;
use base64::prelude::{Engine, BASE64_STANDARD};
use bytes::Bytes;

///
/// What came back from one platform invocation. `function_error` distinguishes "the worker
/// crashed or reported a structured error" (the payload then describes the failure) from a
/// healthy response payload.
///
#[derive(Clone, Debug)]
pub struct InvokeOutput {
    pub payload: Bytes,
    pub function_error: Option<String>,
    /// The platform's captured log tail, when requested.
    pub logs: Option<Vec<u8>>,
}

///
/// The external function-invocation platform, seen from the daemon.
///
#[async_trait]
pub trait FunctionInvoker: Send + Sync {
    ///
    /// Invoke `function` synchronously with the given payload. Transport and authorization
    /// failures are `Err`; a function-side failure is an `Ok` output with `function_error` set.
    ///
    async fn invoke(
        &self,
        function: &str,
        payload: Bytes,
        tail_logs: bool,
    ) -> Result<InvokeOutput, String>;
}

const FUNCTION_ERROR_HEADER: &str = "X-Amz-Function-Error";
const LOG_RESULT_HEADER: &str = "X-Amz-Log-Result";

///
/// The REST shape of the platform's synchronous invoke API:
/// `POST {endpoint}/2015-03-31/functions/{name}/invocations`, with the log tail riding base64
/// in a response header. Authentication is the deployment's concern (a signing proxy or a
/// function URL); the daemon speaks plain HTTP to `invoke_endpoint`.
///
pub struct HttpInvoker {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpInvoker {
    pub fn new(endpoint: &str) -> HttpInvoker {
        HttpInvoker {
            client: reqwest::Client::new(),
            endpoint: endpoint.trim_end_matches('/').to_owned(),
        }
    }
}

#[async_trait]
impl FunctionInvoker for HttpInvoker {
    async fn invoke(
        &self,
        function: &str,
        payload: Bytes,
        tail_logs: bool,
    ) -> Result<InvokeOutput, String> {
        let url = format!("{}/2015-03-31/functions/{function}/invocations", self.endpoint);
        let response = self
            .client
            .post(&url)
            .header("X-Amz-Invocation-Type", "RequestResponse")
            .header("X-Amz-Log-Type", if tail_logs { "Tail" } else { "None" })
            .body(payload)
            .send()
            .await
            .map_err(|e| format!("invoking {function}: {e}"))?;

        let status = response.status();
        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(format!("invoking {function}: not authorized ({status})"));
        }

        let function_error = response
            .headers()
            .get(FUNCTION_ERROR_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.to_owned());
        let logs = response
            .headers()
            .get(LOG_RESULT_HEADER)
            .and_then(|value| value.to_str().ok())
            .and_then(|encoded| BASE64_STANDARD.decode(encoded).ok());

        let payload = response
            .bytes()
            .await
            .map_err(|e| format!("reading response from {function}: {e}"))?;

        if function_error.is_none() && !status.is_success() {
            return Err(format!("invoking {function}: status {status}"));
        }

        Ok(InvokeOutput {
            payload,
            function_error,
            logs,
        })
    }
}
