use std::time::Duration;

use super::error::TrackerError;
use super::response::AnnounceResponse;
use super::AnnounceJob;
use crate::bencode::decode;

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Performs one announce round trip.
pub async fn announce(
    client: &reqwest::Client,
    job: &AnnounceJob,
) -> Result<AnnounceResponse, TrackerError> {
    if !job.url.starts_with("http://") && !job.url.starts_with("https://") {
        return Err(TrackerError::InvalidUrl(job.url.clone()));
    }

    let mut url = format!(
        "{}?info_hash={}&peer_id={}&port={}&uploaded={}&downloaded={}&left={}&compact=1",
        job.url,
        url_encode(&job.info_hash),
        url_encode(&job.peer_id),
        job.port,
        job.stats.uploaded,
        job.stats.downloaded,
        job.stats.left,
    );
    let event = job.event.as_str();
    if !event.is_empty() {
        url.push_str("&event=");
        url.push_str(event);
    }

    let response = client
        .get(&url)
        .timeout(HTTP_TIMEOUT)
        .send()
        .await?
        .bytes()
        .await?;
    AnnounceResponse::from_value(&decode(&response)?)
}

/// Percent-encodes raw bytes for the announce query string.
pub(super) fn url_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 3);
    for &b in bytes {
        if b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.' | b'~') {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{:02X}", b));
        }
    }
    out
}
