//! Service response parsing.
//!
//! Backend replies are small flat XML documents:
//!
//! ```text
//! <rsp stat="ok">
//!   <length>1048576</length><duration>42</duration><complete>false</complete>
//!   <files><file offset="0">live-0001.ts</file><file offset="524288">live-0002.ts</file></files>
//! </rsp>
//! ```
//!
//! Only the fields the buffering core consumes are extracted; everything else
//! is ignored.

use std::collections::HashMap;
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;

use super::{BackendError, BackendResult, Capabilities, SegmentRecord, StreamInfo, TranscodeStatus};

static STATUS: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r#"<rsp\s+stat="(\w+)""#).ok());
static ERROR_MESSAGE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r#"<err[^>]*\bmsg="([^"]*)""#).ok());
static FIELD: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"<([a-z_]+)>([^<]*)</([a-z_]+)>").ok());
static FILE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r#"<file\s+offset="(\d+)"\s*>([^<]+)</file>"#).ok());

/// A service reply that reported `stat="ok"`, with its flat fields.
#[derive(Debug)]
pub struct ServiceResponse {
    method: String,
    body: String,
    fields: HashMap<String, String>,
}

impl ServiceResponse {
    /// Parses a reply body, rejecting anything not marked ok.
    ///
    /// # Errors
    ///
    /// - `BackendError::Rejected` - Reply carries `stat="fail"`
    /// - `BackendError::Malformed` - Reply has no status
    pub fn parse(method: &str, body: &str) -> BackendResult<Self> {
        let status = STATUS
            .as_ref()
            .and_then(|re| re.captures(body))
            .map(|caps| caps[1].to_string())
            .ok_or_else(|| BackendError::Malformed {
                method: method.to_string(),
                reason: "missing rsp status".to_string(),
            })?;

        if status != "ok" {
            let message = ERROR_MESSAGE
                .as_ref()
                .and_then(|re| re.captures(body))
                .map(|caps| caps[1].to_string())
                .unwrap_or(status);
            return Err(BackendError::Rejected {
                method: method.to_string(),
                message,
            });
        }

        let mut fields = HashMap::new();
        if let Some(re) = FIELD.as_ref() {
            for caps in re.captures_iter(body) {
                if caps[1] == caps[3] {
                    fields.insert(caps[1].to_string(), caps[2].trim().to_string());
                }
            }
        }

        Ok(Self {
            method: method.to_string(),
            body: body.to_string(),
            fields,
        })
    }

    /// Raw text of a field, if present.
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }

    fn malformed(&self, reason: String) -> BackendError {
        BackendError::Malformed {
            method: self.method.clone(),
            reason,
        }
    }

    /// Required unsigned integer field.
    ///
    /// # Errors
    ///
    /// - `BackendError::Malformed` - Field missing or not a number
    pub fn required_u64(&self, name: &str) -> BackendResult<u64> {
        let text = self
            .field(name)
            .ok_or_else(|| self.malformed(format!("missing {name}")))?;
        text.parse::<u64>()
            .map_err(|_| self.malformed(format!("{name} is not a number: {text}")))
    }

    /// Optional boolean field; absent means false.
    pub fn flag(&self, name: &str) -> bool {
        matches!(self.field(name), Some("true" | "1" | "yes"))
    }

    /// All `<file offset="..">name</file>` entries in document order.
    pub fn files(&self) -> Vec<SegmentRecord> {
        let Some(re) = FILE.as_ref() else {
            return Vec::new();
        };
        re.captures_iter(&self.body)
            .filter_map(|caps| {
                let offset = caps[1].parse::<u64>().ok()?;
                Some(SegmentRecord::new(caps[2].trim(), offset))
            })
            .collect()
    }
}

/// Interprets a `channel.stream.info` reply.
///
/// # Errors
///
/// - `BackendError::Malformed` - Length or duration missing or not numeric
/// - `BackendError::Rejected` - Backend reported failure
pub fn parse_stream_info(method: &str, body: &str) -> BackendResult<StreamInfo> {
    let response = ServiceResponse::parse(method, body)?;
    let length = response.required_u64("length")?;
    let duration = response.required_u64("duration")?;
    let segments = response.files();

    if segments.windows(2).any(|pair| pair[0].offset >= pair[1].offset) {
        return Err(response.malformed("segment offsets are not increasing".to_string()));
    }

    Ok(StreamInfo {
        length,
        duration: Duration::from_secs(duration),
        complete: response.flag("complete"),
        segments,
    })
}

/// Interprets a `channel.transcode.status` reply.
///
/// # Errors
///
/// - `BackendError::Malformed` - Percentage missing
/// - `BackendError::Rejected` - Backend reported failure
pub fn parse_transcode_status(method: &str, body: &str) -> BackendResult<TranscodeStatus> {
    let response = ServiceResponse::parse(method, body)?;
    if response.flag("failed") {
        return Ok(TranscodeStatus::Failed);
    }
    let text = response
        .field("percentage")
        .ok_or_else(|| response.malformed("missing percentage".to_string()))?;
    match text.parse::<i64>() {
        Ok(percent) if percent < 0 => Ok(TranscodeStatus::Failed),
        Ok(percent) if percent >= 100 => Ok(TranscodeStatus::Ready),
        Ok(percent) => Ok(TranscodeStatus::Preparing(percent as u8)),
        Err(_) => Err(response.malformed(format!("percentage is not a number: {text}"))),
    }
}

/// Interprets a `session.capabilities` reply.
///
/// # Errors
///
/// - `BackendError::Rejected` - Backend reported failure
pub fn parse_capabilities(method: &str, body: &str) -> BackendResult<Capabilities> {
    let response = ServiceResponse::parse(method, body)?;
    Ok(Capabilities {
        epg_rollover: response.flag("epg_rollover"),
        ranged_streams: response.flag("ranged_streams"),
    })
}

/// Interprets a reply that carries nothing but a status.
///
/// # Errors
///
/// - `BackendError::Rejected` - Backend reported failure
pub fn parse_ack(method: &str, body: &str) -> BackendResult<()> {
    ServiceResponse::parse(method, body).map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;

    const INFO: &str = r#"<?xml version="1.0" encoding="utf-8" ?>
<rsp stat="ok">
  <length>2048</length>
  <duration>12</duration>
  <complete>false</complete>
  <files>
    <file offset="0">live-20240101_200000.ts</file>
    <file offset="1000">live-20240101_201500.ts</file>
  </files>
</rsp>"#;

    #[test]
    fn test_parse_stream_info() {
        let info = parse_stream_info("channel.stream.info", INFO).unwrap();
        assert_eq!(info.length, 2048);
        assert_eq!(info.duration, Duration::from_secs(12));
        assert!(!info.complete);
        assert_eq!(
            info.segments,
            vec![
                SegmentRecord::new("live-20240101_200000.ts", 0),
                SegmentRecord::new("live-20240101_201500.ts", 1000),
            ]
        );
    }

    #[test]
    fn test_failed_status_is_rejected_with_message() {
        let body = r#"<rsp stat="fail"><err code="8" msg="Tuner unavailable" /></rsp>"#;
        match parse_ack("channel.stream.start", body) {
            Err(BackendError::Rejected { message, .. }) => assert_eq!(message, "Tuner unavailable"),
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[test]
    fn test_missing_length_is_malformed() {
        let body = r#"<rsp stat="ok"><duration>3</duration></rsp>"#;
        assert!(matches!(
            parse_stream_info("channel.stream.info", body),
            Err(BackendError::Malformed { .. })
        ));
    }

    #[test]
    fn test_garbage_is_malformed() {
        assert!(matches!(
            parse_ack("channel.stream.stop", "<html>502 Bad Gateway</html>"),
            Err(BackendError::Malformed { .. })
        ));
    }

    #[test]
    fn test_non_increasing_offsets_are_malformed() {
        let body = r#"<rsp stat="ok"><length>10</length><duration>1</duration>
            <files><file offset="50">b.ts</file><file offset="50">c.ts</file></files></rsp>"#;
        assert!(parse_stream_info("channel.stream.info", body).is_err());
    }

    #[test]
    fn test_transcode_status_mapping() {
        let method = "channel.transcode.status";
        assert_eq!(
            parse_transcode_status(method, r#"<rsp stat="ok"><percentage>40</percentage></rsp>"#)
                .unwrap(),
            TranscodeStatus::Preparing(40)
        );
        assert_eq!(
            parse_transcode_status(method, r#"<rsp stat="ok"><percentage>100</percentage></rsp>"#)
                .unwrap(),
            TranscodeStatus::Ready
        );
        assert_eq!(
            parse_transcode_status(method, r#"<rsp stat="ok"><percentage>-1</percentage></rsp>"#)
                .unwrap(),
            TranscodeStatus::Failed
        );
    }

    #[test]
    fn test_capabilities_default_to_false() {
        let caps = parse_capabilities("session.capabilities", r#"<rsp stat="ok"></rsp>"#).unwrap();
        assert_eq!(caps, Capabilities::default());

        let caps = parse_capabilities(
            "session.capabilities",
            r#"<rsp stat="ok"><epg_rollover>true</epg_rollover></rsp>"#,
        )
        .unwrap();
        assert!(caps.epg_rollover);
    }
}
