//! HTTP transport for the delivery stage.

use crate::envelope::hash::HASH_HEADER;
use crate::envelope::Sealer;
use crate::error::Error;
use crate::metric::Metric;
use crate::retry::retry;
use crate::sink::Transport;
use std::time::Duration;

/// Bound on a single POST, connect included.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Sends each metric as a one-element batch through the wire envelope.
pub struct HttpTransport {
    client: reqwest::blocking::Client,
    endpoint: String,
    sealer: Sealer,
}

impl HttpTransport {
    /// Create a transport posting to `http://{address}/updates/`.
    pub fn new(address: &str, sealer: Sealer) -> Result<HttpTransport, Error> {
        let client = reqwest::blocking::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| Error::Storage(e.to_string()))?;
        Ok(HttpTransport {
            client,
            endpoint: format!("http://{}/updates/", address),
            sealer,
        })
    }
}

impl Transport for HttpTransport {
    fn deliver(&self, metric: Metric) -> Result<(), Error> {
        let payload = serde_json::to_vec(&[metric])
            .map_err(|e| Error::Payload(e.to_string()))?;
        let sealed = self.sealer.seal(&payload)?;

        retry("sink.http", || {
            let mut request = self
                .client
                .post(&self.endpoint)
                .header("Content-Type", "application/json")
                .header("Content-Encoding", sealed.content_encoding.clone())
                .body(sealed.body.clone());
            if let Some(ref tag) = sealed.hash {
                request = request.header(HASH_HEADER, tag.clone());
            }

            let response = request.send().map_err(|e| Error::from_http(&e))?;
            let status = response.status();
            if status.is_success() {
                Ok(())
            } else if status.is_server_error() {
                Err(Error::Transient(format!("server answered {}", status)))
            } else {
                Err(Error::Storage(format!("server answered {}", status)))
            }
        })
    }
}
