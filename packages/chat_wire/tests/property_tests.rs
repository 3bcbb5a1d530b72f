use proptest::prelude::*;

use chat_wire::{ChatMessage, ClientFrame, PeerMessage, ServerFrame};

fn arb_message() -> impl Strategy<Value = ChatMessage> {
    (".{0,12}", ".{0,12}", ".{0,40}").prop_map(|(t, u, x)| ChatMessage::new(t, u, x))
}

fn arb_client_frame() -> impl Strategy<Value = ClientFrame> {
    prop_oneof![
        ".{0,16}".prop_map(|username| ClientFrame::Join { username }),
        arb_message().prop_map(ClientFrame::Post),
    ]
}

fn arb_server_frame() -> impl Strategy<Value = ServerFrame> {
    prop_oneof![
        prop::collection::vec(arb_message(), 0..10).prop_map(ServerFrame::History),
        arb_message().prop_map(ServerFrame::Broadcast),
    ]
}

proptest! {
    #[test]
    fn client_decode_inverts_encode(frame in arb_client_frame()) {
        let bytes = frame.encode().unwrap();
        prop_assert_eq!(ClientFrame::decode(&bytes).unwrap(), frame);
    }

    #[test]
    fn server_decode_inverts_encode(frame in arb_server_frame()) {
        let bytes = frame.encode().unwrap();
        prop_assert_eq!(ServerFrame::decode(&bytes).unwrap(), frame);
    }

    #[test]
    fn valid_client_bytes_reencode_identically(frame in arb_client_frame()) {
        let bytes = frame.encode().unwrap();
        let decoded = ClientFrame::decode(&bytes).unwrap();
        prop_assert_eq!(decoded.encode().unwrap(), bytes);
    }

    #[test]
    fn valid_server_bytes_reencode_identically(frame in arb_server_frame()) {
        let bytes = frame.encode().unwrap();
        let decoded = ServerFrame::decode(&bytes).unwrap();
        prop_assert_eq!(decoded.encode().unwrap(), bytes);
    }

    #[test]
    fn admission_byte_reencodes_identically_or_is_rejected(byte in any::<u8>()) {
        match ServerFrame::decode_admission(&[byte]) {
            Ok(frame) => {
                prop_assert!(byte <= 1);
                prop_assert_eq!(frame.encode().unwrap(), vec![byte]);
            }
            Err(err) => {
                prop_assert!(byte > 1);
                prop_assert!(err.is_malformed());
            }
        }
    }

    #[test]
    fn every_strict_prefix_is_rejected(frame in arb_server_frame()) {
        let bytes = frame.encode().unwrap();
        for cut in 0..bytes.len() {
            prop_assert!(ServerFrame::decode(&bytes[..cut]).is_err());
        }
    }

    #[test]
    fn arbitrary_bytes_never_panic(bytes in prop::collection::vec(any::<u8>(), 0..64)) {
        let _ = ClientFrame::decode(&bytes);
        let _ = ServerFrame::decode(&bytes);
        let _ = PeerMessage::decode(&bytes);
    }

    #[test]
    fn peer_broadcast_roundtrip(username in ".{0,16}", message in ".{0,40}") {
        let msg = PeerMessage::Broadcast { username, message };
        prop_assert_eq!(PeerMessage::decode(&msg.encode().unwrap()).unwrap(), msg);
    }
}
