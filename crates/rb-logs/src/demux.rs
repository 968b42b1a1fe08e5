//! Docker's multiplexed log stream.
//!
//! Each frame is `[stream type][3 reserved bytes][u32 big-endian length][payload]`.

const HEADER_LEN: usize = 8;
const STDOUT: u8 = 1;
const STDERR: u8 = 2;

/// Heuristic check for framed output: a known stream type followed by three
/// zero bytes.
pub fn looks_multiplexed(bytes: &[u8]) -> bool {
    bytes.len() >= HEADER_LEN && bytes[0] <= STDERR && bytes[1..4] == [0, 0, 0]
}

/// Concatenate stdout and stderr payloads in stream order.
///
/// Frames of other stream types are skipped. A truncated trailing frame is
/// dropped.
pub fn demultiplex(bytes: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(bytes.len());
    let mut rest = bytes;

    while rest.len() >= HEADER_LEN {
        let stream = rest[0];
        let len = u32::from_be_bytes([rest[4], rest[5], rest[6], rest[7]]) as usize;
        let body = &rest[HEADER_LEN..];
        if len > body.len() {
            tracing::debug!(declared = len, available = body.len(), "dropping truncated log frame");
            break;
        }
        if stream == STDOUT || stream == STDERR {
            out.extend_from_slice(&body[..len]);
        }
        rest = &body[len..];
    }

    out
}

/// Decode raw container log bytes into text, demultiplexing when framed.
pub fn decode_container_output(bytes: &[u8]) -> String {
    if looks_multiplexed(bytes) {
        String::from_utf8_lossy(&demultiplex(bytes)).into_owned()
    } else {
        String::from_utf8_lossy(bytes).into_owned()
    }
}
