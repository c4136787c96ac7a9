/// Parsed client-side transport info from the RTSP `Transport` header.
///
/// Extracts the `client_port=RTP-RTCP` pair from the header value. Only
/// `RTP/AVP` UDP unicast is accepted; interleaved TCP is detected so the
/// handler can decline it with 461 Unsupported Transport.
#[derive(Debug, Clone)]
pub struct TransportHeader {
    /// Client's requested RTP port.
    pub client_rtp_port: u16,
    /// Client's requested RTCP port.
    pub client_rtcp_port: u16,
}

impl TransportHeader {
    /// Parse the `Transport` header value (RFC 2326 §12.39).
    ///
    /// Looks for `client_port=RTP-RTCP` among semicolon-separated parameters.
    ///
    /// ## Examples
    ///
    /// ```
    /// use rtsp_multistream::session::transport::TransportHeader;
    ///
    /// let th = TransportHeader::parse("RTP/AVP;unicast;client_port=8000-8001").unwrap();
    /// assert_eq!(th.client_rtp_port, 8000);
    /// assert_eq!(th.client_rtcp_port, 8001);
    ///
    /// assert!(TransportHeader::parse("RTP/AVP;unicast").is_none());
    /// ```
    pub fn parse(header: &str) -> Option<Self> {
        for part in header.split(';') {
            let part = part.trim();
            if let Some(ports) = part.strip_prefix("client_port=") {
                let port_parts: Vec<&str> = ports.split('-').collect();

                if port_parts.len() == 2 {
                    let rtp_port: u16 = port_parts[0].parse().ok()?;
                    let rtcp_port: u16 = port_parts[1].parse().ok()?;

                    return Some(TransportHeader {
                        client_rtp_port: rtp_port,
                        client_rtcp_port: rtcp_port,
                    });
                }
            }
        }
        None
    }

    /// Whether the header requests interleaved TCP delivery
    /// (`RTP/AVP/TCP` or an `interleaved=` parameter).
    pub fn is_interleaved(header: &str) -> bool {
        header
            .split(';')
            .map(str::trim)
            .any(|p| p.eq_ignore_ascii_case("RTP/AVP/TCP") || p.starts_with("interleaved="))
    }

    /// Format the server's `Transport` response value for SETUP.
    pub fn response_value(&self, server_rtp_port: u16, server_rtcp_port: u16) -> String {
        format!(
            "RTP/AVP;unicast;client_port={}-{};server_port={}-{}",
            self.client_rtp_port, self.client_rtcp_port, server_rtp_port, server_rtcp_port
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_valid_transport() {
        let th = TransportHeader::parse("RTP/AVP;unicast;client_port=5000-5001").unwrap();
        assert_eq!(th.client_rtp_port, 5000);
        assert_eq!(th.client_rtcp_port, 5001);
    }

    #[test]
    fn parse_no_client_port() {
        assert!(TransportHeader::parse("RTP/AVP;unicast").is_none());
    }

    #[test]
    fn detects_interleaved_tcp() {
        assert!(TransportHeader::is_interleaved(
            "RTP/AVP/TCP;unicast;interleaved=0-1"
        ));
        assert!(TransportHeader::is_interleaved(
            "RTP/AVP;unicast;interleaved=0-1"
        ));
        assert!(!TransportHeader::is_interleaved(
            "RTP/AVP;unicast;client_port=5000-5001"
        ));
    }

    #[test]
    fn response_value_carries_both_port_pairs() {
        let th = TransportHeader::parse("RTP/AVP;unicast;client_port=8000-8001").unwrap();
        assert_eq!(
            th.response_value(6000, 6001),
            "RTP/AVP;unicast;client_port=8000-8001;server_port=6000-6001"
        );
    }
}
