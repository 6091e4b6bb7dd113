//! SDP rewriting for send-only publishing

const SENDONLY: &str = "a=sendonly";

/// Force every audio/video media section to `a=sendonly`.
///
/// `a=sendrecv` and `a=recvonly` become `a=sendonly`; `a=inactive` is left
/// alone. Media sections without any direction attribute (implicitly
/// `sendrecv`) get an explicit `a=sendonly` appended. Line endings are
/// preserved.
pub fn force_sendonly(sdp: &str) -> String {
    let eol = if sdp.contains("\r\n") { "\r\n" } else { "\n" };
    let trailing = sdp.ends_with(eol);
    let body = if trailing { &sdp[..sdp.len() - eol.len()] } else { sdp };

    let mut out: Vec<&str> = Vec::new();
    let mut in_av_media = false;
    let mut has_direction = false;

    for line in body.split(eol) {
        if line.starts_with("m=") {
            if in_av_media && !has_direction {
                out.push(SENDONLY);
            }
            in_av_media = line.starts_with("m=audio") || line.starts_with("m=video");
            has_direction = false;
        }

        match line {
            "a=sendrecv" | "a=recvonly" => {
                out.push(SENDONLY);
                has_direction = true;
            }
            "a=sendonly" | "a=inactive" => {
                out.push(line);
                has_direction = true;
            }
            _ => out.push(line),
        }
    }
    if in_av_media && !has_direction {
        out.push(SENDONLY);
    }

    let mut rewritten = out.join(eol);
    if trailing {
        rewritten.push_str(eol);
    }
    rewritten
}

#[cfg(test)]
mod tests {
    use super::*;

    const OFFER: &str = "v=0\r\no=- 1 2 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n\
m=video 9 UDP/TLS/RTP/SAVPF 96\r\nc=IN IP4 0.0.0.0\r\na=mid:0\r\na=sendrecv\r\n\
m=audio 9 UDP/TLS/RTP/SAVPF 111\r\nc=IN IP4 0.0.0.0\r\na=mid:1\r\na=recvonly\r\n";

    #[test]
    fn rewrites_directions() {
        let out = force_sendonly(OFFER);
        assert!(!out.contains("a=sendrecv"));
        assert!(!out.contains("a=recvonly"));
        assert_eq!(out.matches("a=sendonly").count(), 2);
        assert!(out.ends_with("\r\n"));
        assert!(out.contains("a=mid:1\r\na=sendonly\r\n"));
    }

    #[test]
    fn adds_direction_where_missing() {
        let sdp = "v=0\nm=video 9 RTP/AVP 96\na=mid:0\nm=application 9 UDP/DTLS/SCTP webrtc-datachannel\na=mid:1\n";
        let out = force_sendonly(sdp);
        assert_eq!(
            out,
            "v=0\nm=video 9 RTP/AVP 96\na=mid:0\na=sendonly\nm=application 9 UDP/DTLS/SCTP webrtc-datachannel\na=mid:1\n"
        );
    }

    #[test]
    fn keeps_inactive_and_is_idempotent() {
        let sdp = "v=0\r\nm=audio 0 RTP/AVP 0\r\na=inactive\r\nm=video 9 RTP/AVP 96\r\na=sendonly";
        let once = force_sendonly(sdp);
        assert_eq!(once, sdp);
        assert_eq!(force_sendonly(&once), once);
    }
}
