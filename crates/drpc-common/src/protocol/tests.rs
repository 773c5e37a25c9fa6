//! Tests for headers, options and handshake validation.

#[cfg(test)]
mod tests {
    use super::super::*;
    use crate::transport::CodecType;
    use std::time::Duration;

    #[test]
    fn test_request_header() {
        let header = Header::request("Arith.Sum", 3);
        assert_eq!(header.service_method, "Arith.Sum");
        assert_eq!(header.seq, 3);
        assert!(!header.is_error());
    }

    #[test]
    fn test_reply_keeps_seq() {
        let request = Header::request("Arith.Sum", 42);

        let ok = request.reply();
        assert_eq!(ok.seq, 42);
        assert!(!ok.is_error());

        let failed = request.reply_error("something failed");
        assert_eq!(failed.seq, 42);
        assert_eq!(failed.error, "something failed");
        assert_eq!(failed.service_method, "Arith.Sum");
    }

    #[test]
    fn test_split_service_method() {
        let header = Header::request("Arith.Sum", 1);
        assert_eq!(header.split_service_method(), Some(("Arith", "Sum")));

        // Last dot wins
        let nested = Header::request("pkg.Arith.Sum", 1);
        assert_eq!(nested.split_service_method(), Some(("pkg.Arith", "Sum")));

        let bad = Header::request("NoDot", 1);
        assert_eq!(bad.split_service_method(), None);

        assert_eq!(split_service_method("Arith."), Some(("Arith", "")));
    }

    #[test]
    fn test_default_options() {
        let options = Options::default();
        assert_eq!(options.codec_type, CodecType::Json);
        assert_eq!(options.connect_timeout, Duration::from_secs(10));
        assert_eq!(options.handle_timeout, Duration::ZERO);
    }

    #[test]
    fn test_handshake_stamps_magic() {
        let handshake = Options::default()
            .with_codec(CodecType::Postcard)
            .with_handle_timeout(Duration::from_millis(1500))
            .to_handshake();

        assert_eq!(handshake.magic_number, MAGIC_NUMBER);
        assert_eq!(handshake.codec_type, "application/postcard");
        assert_eq!(handshake.handle_timeout_ms, 1500);
    }

    #[test]
    fn test_handshake_validate() {
        let options = Options::default().with_handle_timeout(Duration::from_secs(2));
        let validated = options.to_handshake().validate().unwrap();
        assert_eq!(validated, options);
    }

    #[test]
    fn test_handshake_rejects_bad_magic() {
        let mut handshake = Options::default().to_handshake();
        handshake.magic_number = 0xdead;
        assert_eq!(handshake.validate(), Err(RpcError::InvalidMagic(0xdead)));
    }

    #[test]
    fn test_handshake_rejects_unknown_codec() {
        let mut handshake = Options::default().to_handshake();
        handshake.codec_type = "application/gob".to_string();
        assert_eq!(
            handshake.validate(),
            Err(RpcError::UnknownCodec("application/gob".to_string()))
        );
    }

    #[test]
    fn test_handshake_is_plain_json() {
        let handshake = Options::default().to_handshake();
        let value = serde_json::to_value(&handshake).unwrap();
        assert_eq!(value["magic_number"], 0x3bef5c);
        assert_eq!(value["codec_type"], "application/json");
    }

    #[test]
    fn test_error_classification() {
        assert!(RpcError::ConnectTimeout(Duration::from_secs(1)).is_timeout());
        assert!(RpcError::DeadlineExceeded(Duration::from_secs(1)).is_timeout());
        assert!(RpcError::HandshakeTimeout(Duration::from_secs(1)).is_timeout());
        assert!(!RpcError::Cancelled.is_timeout());
        assert!(RpcError::Shutdown.is_shutdown());
        assert!(!RpcError::Server("x".into()).is_shutdown());
    }

    #[test]
    fn test_io_eof_maps_to_connection_closed() {
        let err: RpcError = std::io::Error::from(std::io::ErrorKind::UnexpectedEof).into();
        assert_eq!(err, RpcError::ConnectionClosed);

        let err: RpcError = std::io::Error::from(std::io::ErrorKind::PermissionDenied).into();
        assert!(matches!(err, RpcError::Io(_)));
    }
}
