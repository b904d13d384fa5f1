#[cfg(test)]
mod crypto_tests {
    use crate::crypto::{
        SessionKey, TAG_LEN, decrypt, decrypt_with_aad, derive_session_key, encrypt,
        encrypt_with_aad, nonce_for,
    };
    use crate::error::MeshError;
    use anyhow::Result;

    #[test]
    fn test_derive_session_key_is_deterministic() -> Result<()> {
        let first = derive_session_key("URBARN", "15102");
        let second = derive_session_key("URBARN", "15102");
        assert_eq!(first, second);

        let other = derive_session_key("Fulife", "2846");
        assert_ne!(first, other);
        Ok(())
    }

    #[test]
    fn test_derive_session_key_separates_name_and_password() -> Result<()> {
        // Same concatenation, different split
        assert_ne!(
            derive_session_key("URBARN1", "5102"),
            derive_session_key("URBARN", "15102")
        );
        Ok(())
    }

    #[test]
    fn test_session_key_debug_is_redacted() -> Result<()> {
        let key = SessionKey::from_bytes([0xab; 16]);
        let printed = format!("{key:?}");
        assert!(!printed.contains("ab"));
        assert!(!printed.contains("171"));
        Ok(())
    }

    #[test]
    fn test_encrypt_decrypt_round_trip() -> Result<()> {
        let key = derive_session_key("URBARN", "15102");
        for (sequence, plaintext) in [
            (1u32, vec![0xd0, 0x01]),
            (2, vec![0xe2, 0xff, 0x80, 0x00]),
            (0x00ff_ffff, b"longer plaintext body".to_vec()),
            (7, Vec::new()),
        ] {
            let sealed = encrypt(&key, sequence, &plaintext)?;
            assert_eq!(sealed.ciphertext.len(), plaintext.len());
            let opened = decrypt(&key, sequence, &sealed.ciphertext, &sealed.tag)?;
            assert_eq!(opened, plaintext);
        }
        Ok(())
    }

    #[test]
    fn test_any_flipped_bit_fails_closed() -> Result<()> {
        let key = derive_session_key("URBARN", "15102");
        let sealed = encrypt(&key, 42, &[0xd2, 0x40, 0x11])?;

        for byte in 0..sealed.ciphertext.len() {
            for bit in 0..8 {
                let mut ciphertext = sealed.ciphertext.clone();
                ciphertext[byte] ^= 1 << bit;
                let result = decrypt(&key, 42, &ciphertext, &sealed.tag);
                assert!(matches!(result, Err(MeshError::Authentication(_))));
            }
        }

        for byte in 0..TAG_LEN {
            for bit in 0..8 {
                let mut tag = sealed.tag;
                tag[byte] ^= 1 << bit;
                let result = decrypt(&key, 42, &sealed.ciphertext, &tag);
                assert!(matches!(result, Err(MeshError::Authentication(_))));
            }
        }
        Ok(())
    }

    #[test]
    fn test_wrong_key_sequence_or_aad_fails() -> Result<()> {
        let key = derive_session_key("URBARN", "15102");
        let sealed = encrypt_with_aad(&key, 9, b"header", &[0xd0, 0x00])?;

        let other_key = derive_session_key("Fulife", "2846");
        assert!(decrypt_with_aad(&other_key, 9, b"header", &sealed.ciphertext, &sealed.tag).is_err());
        assert!(decrypt_with_aad(&key, 10, b"header", &sealed.ciphertext, &sealed.tag).is_err());
        assert!(decrypt_with_aad(&key, 9, b"HEADER", &sealed.ciphertext, &sealed.tag).is_err());
        assert!(decrypt_with_aad(&key, 9, b"header", &sealed.ciphertext, &sealed.tag).is_ok());
        Ok(())
    }

    #[test]
    fn test_distinct_sequences_never_share_a_nonce() -> Result<()> {
        let sequences = [0u32, 1, 2, 0xff, 0x100, 0xffff, 0x10000, 0x00ff_ffff];
        for (i, a) in sequences.iter().enumerate() {
            for b in &sequences[i + 1..] {
                assert_ne!(nonce_for(*a), nonce_for(*b), "{a} and {b} collide");
            }
        }

        let key = derive_session_key("URBARN", "15102");
        let first = encrypt(&key, 1, &[0xd0, 0x01])?;
        let second = encrypt(&key, 2, &[0xd0, 0x01])?;
        assert_ne!(first, second);
        Ok(())
    }

    #[test]
    fn test_link_keys_are_bound_to_nonces_and_direction() -> Result<()> {
        let mesh_key = derive_session_key("URBARN", "15102");
        let first = mesh_key.link_keys(&[1; 8], &[2; 8]);
        let again = mesh_key.link_keys(&[1; 8], &[2; 8]);
        let second = mesh_key.link_keys(&[1; 8], &[3; 8]);
        let login = mesh_key.login_key();

        assert_eq!(first, again);
        assert_ne!(first.client_to_device, first.device_to_client);
        assert_ne!(first.client_to_device, second.client_to_device);
        assert_ne!(first.client_to_device, login);

        // A frame sealed for one session does not open in another
        let sealed = encrypt(&first.client_to_device, 1, &[0xd0, 0x01])?;
        assert!(decrypt(&second.client_to_device, 1, &sealed.ciphertext, &sealed.tag).is_err());
        Ok(())
    }

    #[test]
    fn test_login_reply_key_is_bound_to_client_nonce() -> Result<()> {
        let mesh_key = derive_session_key("URBARN", "15102");
        let earlier = mesh_key.login_reply_key(&[1; 8]);
        let later = mesh_key.login_reply_key(&[2; 8]);

        assert_eq!(earlier, mesh_key.login_reply_key(&[1; 8]));
        assert_ne!(earlier, later);
        assert_ne!(earlier, mesh_key.login_key());

        let reply = encrypt(&earlier, 0, &[0x0d, 9, 9, 9, 9, 9, 9, 9, 9])?;
        assert!(decrypt(&later, 0, &reply.ciphertext, &reply.tag).is_err());
        Ok(())
    }
}

#[cfg(test)]
mod codec_tests {
    use crate::codec::{
        Frame, MAX_FRAME_LEN, MAX_SEQUENCE, MIN_FRAME_LEN, decode_frame, encode_frame,
    };
    use crate::command::Opcode;
    use crate::error::FrameError;
    use anyhow::Result;

    fn power_frame() -> Frame {
        Frame {
            mesh_address: 0x1234,
            opcode: Opcode::POWER,
            sequence: 0x030201,
            ciphertext: vec![0xaa, 0xbb],
            tag: [0x01, 0x02, 0x03, 0x04],
        }
    }

    #[test]
    fn test_encode_layout_is_little_endian() -> Result<()> {
        let bytes = encode_frame(&power_frame())?;
        assert_eq!(
            bytes,
            vec![
                0x34, 0x12, 0xd0, 0x01, 0x02, 0x03, 0xaa, 0xbb, 0x01, 0x02, 0x03, 0x04
            ]
        );
        Ok(())
    }

    #[test]
    fn test_decode_encode_round_trip() -> Result<()> {
        let frames = [
            power_frame(),
            Frame {
                mesh_address: 0xffff,
                opcode: Opcode::COLOR,
                sequence: MAX_SEQUENCE,
                ciphertext: vec![1, 2, 3, 4],
                tag: [9; 4],
            },
            Frame {
                mesh_address: 0,
                opcode: Opcode::LOGIN,
                sequence: 0,
                ciphertext: vec![7; 9],
                tag: [0; 4],
            },
        ];

        for frame in frames {
            let decoded = decode_frame(&encode_frame(&frame)?)?;
            assert_eq!(decoded, frame);
        }
        Ok(())
    }

    #[test]
    fn test_truncated_input_is_a_typed_error() -> Result<()> {
        let bytes = encode_frame(&power_frame())?;
        for len in 0..bytes.len() {
            let result = decode_frame(&bytes[..len]);
            assert!(
                matches!(result, Err(FrameError::Truncated { .. })),
                "prefix of {len} bytes gave {result:?}"
            );
        }

        match decode_frame(&bytes[..3]) {
            Err(FrameError::Truncated { needed, actual }) => {
                assert_eq!(needed, MIN_FRAME_LEN);
                assert_eq!(actual, 3);
            }
            other => panic!("unexpected {other:?}"),
        }
        Ok(())
    }

    #[test]
    fn test_declared_length_must_match() -> Result<()> {
        let mut bytes = encode_frame(&power_frame())?;
        bytes.insert(8, 0xcc);

        match decode_frame(&bytes) {
            Err(FrameError::LengthMismatch {
                opcode,
                declared,
                actual,
            }) => {
                assert_eq!(opcode, Opcode::POWER);
                assert_eq!(declared, 2);
                assert_eq!(actual, 3);
            }
            other => panic!("unexpected {other:?}"),
        }
        Ok(())
    }

    #[test]
    fn test_unknown_opcode_and_oversize_rejected() -> Result<()> {
        let mut bytes = encode_frame(&power_frame())?;
        bytes[2] = 0x77;
        assert_eq!(
            decode_frame(&bytes),
            Err(FrameError::UnknownOpcode(Opcode(0x77)))
        );

        let oversize = vec![0u8; MAX_FRAME_LEN + 1];
        assert_eq!(
            decode_frame(&oversize),
            Err(FrameError::TooLong(MAX_FRAME_LEN + 1))
        );
        Ok(())
    }

    #[test]
    fn test_encode_rejects_unrepresentable_frames() -> Result<()> {
        let mut frame = power_frame();
        frame.sequence = MAX_SEQUENCE + 1;
        assert_eq!(
            encode_frame(&frame),
            Err(FrameError::SequenceOutOfRange(MAX_SEQUENCE + 1))
        );

        let mut frame = power_frame();
        frame.ciphertext = vec![0; 16];
        assert!(matches!(encode_frame(&frame), Err(FrameError::TooLong(_))));
        Ok(())
    }
}

#[cfg(test)]
mod command_tests {
    use crate::command::{Command, LightStatus, OPCODES, Opcode, Rgb};
    use crate::error::FrameError;
    use anyhow::Result;
    use std::collections::HashSet;

    fn every_command() -> Vec<Command> {
        vec![
            Command::Login { nonce: [1; 8] },
            Command::LoginAck { nonce: [2; 8] },
            Command::Power(true),
            Command::Power(false),
            Command::Brightness(55),
            Command::Color(Rgb::new(0x10, 0x20, 0x30)),
            Command::QueryStatus,
            Command::Status(LightStatus {
                on: true,
                brightness: 80,
                color: Rgb::new(1, 2, 3),
            }),
            Command::Ack {
                sequence: 0x0a0b0c,
                status: 0,
            },
        ]
    }

    #[test]
    fn test_opcode_table_is_consistent() -> Result<()> {
        let codes: HashSet<u8> = OPCODES.iter().map(|info| info.opcode.0).collect();
        assert_eq!(codes.len(), OPCODES.len());

        for command in every_command() {
            let body = command.to_body();
            let declared = command.opcode().param_len();
            assert_eq!(Some(body.len() - 1), declared, "{command:?}");
            assert_eq!(body[0], command.opcode().0);
        }
        Ok(())
    }

    #[test]
    fn test_body_parses_back() -> Result<()> {
        for command in every_command() {
            let parsed = Command::from_body(command.opcode(), &command.to_body())?;
            assert_eq!(parsed, command);
        }
        Ok(())
    }

    #[test]
    fn test_invalid_payloads_rejected() -> Result<()> {
        assert!(Command::brightness(101).is_err());
        assert_eq!(Command::brightness(100), Ok(Command::Brightness(100)));

        assert!(matches!(
            Command::from_body(Opcode::POWER, &[0xd0, 2]),
            Err(FrameError::InvalidPayload { .. })
        ));
        assert!(matches!(
            Command::from_body(Opcode::BRIGHTNESS, &[0xd2, 150]),
            Err(FrameError::InvalidPayload { .. })
        ));
        assert!(matches!(
            Command::from_body(Opcode::POWER, &[0xd2, 1]),
            Err(FrameError::InvalidPayload { .. })
        ));
        assert!(matches!(
            Command::from_body(Opcode::COLOR, &[0xe2, 1]),
            Err(FrameError::LengthMismatch { .. })
        ));
        Ok(())
    }

    #[test]
    fn test_only_client_commands_expect_acks() -> Result<()> {
        assert!(Command::Power(true).expects_ack());
        assert!(Command::QueryStatus.expects_ack());
        assert!(!Command::Login { nonce: [0; 8] }.expects_ack());
        assert!(
            !Command::Ack {
                sequence: 1,
                status: 0
            }
            .expects_ack()
        );
        Ok(())
    }

    #[test]
    fn test_rgb_parse_and_display() -> Result<()> {
        let color = "#ff8000".parse::<Rgb>().map_err(anyhow::Error::msg)?;
        assert_eq!(color, Rgb::new(0xff, 0x80, 0x00));
        assert_eq!(color.to_string(), "#ff8000");
        assert_eq!("00ff00".parse::<Rgb>(), Ok(Rgb::new(0, 0xff, 0)));
        assert!("#fff".parse::<Rgb>().is_err());
        assert!("zzzzzz".parse::<Rgb>().is_err());
        Ok(())
    }

    #[test]
    fn test_opcode_display() -> Result<()> {
        assert_eq!(Opcode::POWER.to_string(), "0xd0");
        assert_eq!(Opcode::LOGIN.name(), "login");
        assert_eq!(Opcode(0x01).name(), "unknown");
        Ok(())
    }
}

#[cfg(test)]
mod config_tests {
    use crate::config::{MeshConfig, MeshIdentity, SessionConfig};
    use crate::error::ConfigError;
    use anyhow::{Context, Result};
    use std::time::Duration;

    #[test]
    fn test_default_credentials_order() -> Result<()> {
        let config = MeshConfig::default();
        config.validate()?;
        let names: Vec<&str> = config.credentials.iter().map(|i| i.name()).collect();
        assert_eq!(names, ["URBARN", "Fulife"]);
        assert_eq!(config.credentials[0].password(), "15102");
        assert_eq!(config.credentials[1].password(), "2846");
        assert_eq!(config.session.failure_threshold, 3);
        Ok(())
    }

    #[test]
    fn test_identity_validation() -> Result<()> {
        MeshIdentity::new("URBARN", "15102")?;
        assert!(matches!(
            MeshIdentity::new("", "15102"),
            Err(ConfigError::InvalidIdentity(_))
        ));
        assert!(matches!(
            MeshIdentity::new("URBARN", ""),
            Err(ConfigError::InvalidIdentity(_))
        ));
        assert!(matches!(
            MeshIdentity::new("a-mesh-name-that-is-too-long", "1"),
            Err(ConfigError::InvalidIdentity(_))
        ));
        Ok(())
    }

    #[test]
    fn test_identity_debug_hides_password() -> Result<()> {
        let identity = MeshIdentity::new("URBARN", "15102")?;
        let printed = format!("{identity:?}");
        assert!(printed.contains("URBARN"));
        assert!(!printed.contains("15102"));
        Ok(())
    }

    #[test]
    fn test_partial_json_keeps_defaults() -> Result<()> {
        let config = MeshConfig::from_json(
            r#"{
                "credentials": [{"name": "Home", "password": "1234"}],
                "session": {"ack_timeout_ms": 500, "failure_threshold": 5}
            }"#,
        )?;

        assert_eq!(config.credentials.len(), 1);
        assert_eq!(config.credentials[0].name(), "Home");
        assert_eq!(config.session.ack_timeout(), Duration::from_millis(500));
        assert_eq!(config.session.failure_threshold, 5);
        assert_eq!(
            config.session.handshake_timeout(),
            SessionConfig::default().handshake_timeout()
        );
        assert!(!config.discovery.service_uuids.is_empty());
        Ok(())
    }

    #[test]
    fn test_invalid_json_configs() -> Result<()> {
        assert!(matches!(
            MeshConfig::from_json("{ not json"),
            Err(ConfigError::Parse(_))
        ));
        assert!(matches!(
            MeshConfig::from_json(r#"{"credentials": []}"#),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            MeshConfig::from_json(r#"{"credentials": [{"name": "", "password": "1"}]}"#),
            Err(ConfigError::InvalidIdentity(_))
        ));
        assert!(matches!(
            MeshConfig::from_json(r#"{"session": {"failure_threshold": 0}}"#),
            Err(ConfigError::Invalid(_))
        ));
        Ok(())
    }

    #[test]
    fn test_load_from_file() -> Result<()> {
        let path = std::env::temp_dir().join(format!("lightmesh-{}.json", uuid::Uuid::new_v4()));
        let config = MeshConfig::default();
        std::fs::write(&path, serde_json::to_string_pretty(&config)?)?;

        let loaded = MeshConfig::load(&path).context("Failed to load written config")?;
        std::fs::remove_file(&path)?;
        assert_eq!(loaded, config);

        assert!(matches!(
            MeshConfig::load(&path),
            Err(ConfigError::Io(_))
        ));
        Ok(())
    }

    #[test]
    fn test_with_primary_moves_identity_first() -> Result<()> {
        let config = MeshConfig::default().with_primary(MeshIdentity::fulife());
        let names: Vec<&str> = config.credentials.iter().map(|i| i.name()).collect();
        assert_eq!(names, ["Fulife", "URBARN"]);

        let custom = MeshIdentity::new("Garden", "99")?;
        let config = MeshConfig::default().with_primary(custom);
        assert_eq!(config.credentials.len(), 3);
        assert_eq!(config.credentials[0].name(), "Garden");
        Ok(())
    }

    #[test]
    fn test_backoff_doubles() -> Result<()> {
        let session = SessionConfig {
            retry_backoff_ms: 10,
            ..SessionConfig::default()
        };
        assert_eq!(session.backoff(1), Duration::from_millis(10));
        assert_eq!(session.backoff(2), Duration::from_millis(20));
        assert_eq!(session.backoff(3), Duration::from_millis(40));
        Ok(())
    }
}

#[cfg(test)]
mod sequence_tests {
    use crate::codec::MAX_SEQUENCE;
    use crate::connection::{FailureTracker, SequenceCounter};
    use anyhow::Result;

    #[test]
    fn test_counter_starts_after_handshake() -> Result<()> {
        let mut counter = SequenceCounter::new();
        assert_eq!(counter.last(), None);
        assert_eq!(counter.next(), Some(1));
        assert_eq!(counter.next(), Some(2));
        assert_eq!(counter.last(), Some(2));
        Ok(())
    }

    #[test]
    fn test_counter_exhausts_instead_of_wrapping() -> Result<()> {
        let mut counter = SequenceCounter::starting_at(MAX_SEQUENCE);
        assert!(!counter.is_exhausted());
        assert_eq!(counter.next(), Some(MAX_SEQUENCE));
        assert!(counter.is_exhausted());
        assert_eq!(counter.next(), None);
        assert_eq!(counter.next(), None);
        Ok(())
    }

    #[test]
    fn test_failure_tracker_threshold() -> Result<()> {
        let mut tracker = FailureTracker::new(3);
        assert!(!tracker.record_failure("one"));
        assert!(!tracker.record_failure("two"));
        tracker.record_success();
        assert_eq!(tracker.consecutive(), 0);

        assert!(!tracker.record_failure("one"));
        assert!(!tracker.record_failure("two"));
        assert!(tracker.record_failure("three"));
        assert_eq!(tracker.consecutive(), 0);
        assert_eq!(tracker.total(), 5);
        Ok(())
    }
}

#[cfg(test)]
mod roster_tests {
    use crate::command::LightStatus;
    use crate::state::{Device, Roster};
    use crate::transport::TransportId;
    use anyhow::{Context, Result};

    fn device(id: &str, rssi: i16) -> Device {
        let mut device = Device::new(0x0010, TransportId::new(id));
        device.rssi = Some(rssi);
        device
    }

    #[test]
    fn test_observe_keeps_session_facts() -> Result<()> {
        let mut roster = Roster::new(3);
        let id = TransportId::new("aa");
        roster.observe(device("aa", -70));
        roster.mark_authenticated(&id, true);
        roster.update_status(&id, LightStatus::default());

        roster.observe(device("aa", -50));
        let known = roster.get(&id).context("device missing")?;
        assert!(known.is_authenticated);
        assert!(known.status.is_some());
        assert_eq!(known.rssi, Some(-50));
        assert_eq!(roster.len(), 1);
        Ok(())
    }

    #[test]
    fn test_devices_sorted_by_signal() -> Result<()> {
        let mut roster = Roster::new(3);
        roster.observe(device("weak", -90));
        roster.observe(device("strong", -40));
        roster.observe(device("mid", -65));

        let order: Vec<String> = roster
            .devices()
            .into_iter()
            .map(|d| d.transport_id.0)
            .collect();
        assert_eq!(order, ["strong", "mid", "weak"]);
        Ok(())
    }

    #[test]
    fn test_unreachable_budget() -> Result<()> {
        let mut roster = Roster::new(2);
        let id = TransportId::new("aa");
        roster.observe(device("aa", -60));

        assert!(!roster.record_unreachable(&id));
        roster.record_exchange(&id);
        assert!(!roster.record_unreachable(&id));
        assert!(roster.record_unreachable(&id));
        assert!(roster.is_empty());
        assert!(!roster.record_unreachable(&id));
        Ok(())
    }
}

#[cfg(test)]
mod discovery_tests {
    use crate::codec::LOCAL_ADDRESS;
    use crate::config::{DiscoveryConfig, MESH_PROXY_SERVICE, MeshIdentity};
    use crate::discovery::{is_mesh_fixture, mesh_address, scan};
    use crate::transport::simulated::{SimulatedDevice, SimulatedTransport};
    use crate::transport::{Advertisement, TransportId};
    use anyhow::Result;
    use std::time::Duration;
    use uuid::Uuid;

    fn advert(name: Option<&str>, services: Vec<Uuid>) -> Advertisement {
        Advertisement {
            transport_id: TransportId::new("00:11:22:33:44:55"),
            local_name: name.map(str::to_string),
            rssi: Some(-60),
            service_uuids: services,
            ..Advertisement::default()
        }
    }

    #[test]
    fn test_filter_by_service_or_name() -> Result<()> {
        let config = DiscoveryConfig::default();

        assert!(is_mesh_fixture(&advert(None, vec![MESH_PROXY_SERVICE]), &config));
        assert!(is_mesh_fixture(&advert(Some("urbarn lamp"), vec![]), &config));
        assert!(is_mesh_fixture(&advert(Some("FULIFE-02"), vec![]), &config));
        assert!(!is_mesh_fixture(&advert(Some("Headphones"), vec![]), &config));
        assert!(!is_mesh_fixture(&advert(None, vec![Uuid::new_v4()]), &config));
        Ok(())
    }

    #[test]
    fn test_mesh_address_from_manufacturer_data() -> Result<()> {
        let mut with_data = advert(None, vec![]);
        with_data.manufacturer_data.insert(0x0211, vec![0x34, 0x12, 0xff]);
        assert_eq!(mesh_address(&with_data), 0x1234);

        let mut short = advert(None, vec![]);
        short.manufacturer_data.insert(0x0211, vec![0x34]);
        assert_eq!(mesh_address(&short), LOCAL_ADDRESS);
        assert_eq!(mesh_address(&advert(None, vec![])), LOCAL_ADDRESS);
        Ok(())
    }

    #[tokio::test]
    async fn test_scan_ignores_other_devices() -> Result<()> {
        let lamp = SimulatedDevice::new("lamp", 0x0021, &MeshIdentity::urbarn()).with_rssi(-70);
        let strip = SimulatedDevice::new("strip", 0x0022, &MeshIdentity::fulife()).with_rssi(-45);
        let speaker = SimulatedDevice::new("speaker", 0x0099, &MeshIdentity::urbarn())
            .with_name(Some("Speaker"))
            .with_services(vec![]);
        let transport = SimulatedTransport::new()
            .with_device(lamp)
            .with_device(strip)
            .with_device(speaker);

        let devices = scan(
            &transport,
            &DiscoveryConfig::default(),
            Duration::from_millis(100),
        )
        .await?;

        let ids: Vec<&str> = devices.iter().map(|d| d.transport_id.as_str()).collect();
        assert_eq!(ids, ["strip", "lamp"]);
        assert_eq!(devices[0].mesh_address, 0x0022);
        Ok(())
    }
}

#[cfg(test)]
mod session_tests {
    use crate::client::MeshClient;
    use crate::codec::{BROADCAST_ADDRESS, decode_frame};
    use crate::command::{Command, LightStatus, Opcode, Rgb};
    use crate::config::{MeshConfig, MeshIdentity};
    use crate::connection::{SessionManager, SessionState};
    use crate::error::{MeshError, TransportError};
    use crate::light;
    use crate::packet::{open_command, seal_command};
    use crate::state::{Device, Roster};
    use crate::transport::simulated::{SimulatedDevice, SimulatedTransport};
    use crate::transport::{Link, Transport, TransportId};
    use anyhow::{Context, Result};
    use async_trait::async_trait;
    use futures::StreamExt;
    use futures::stream::{self, BoxStream};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::{Mutex, mpsc};

    fn fast_config() -> MeshConfig {
        let mut config = MeshConfig::default();
        config.session.handshake_timeout_ms = 200;
        config.session.ack_timeout_ms = 200;
        config.session.connect_timeout_ms = 500;
        config.session.retry_backoff_ms = 1;
        config
    }

    fn client_for(devices: &[&SimulatedDevice], config: MeshConfig) -> Result<MeshClient> {
        let transport = devices
            .iter()
            .fold(SimulatedTransport::new(), |t, d| t.with_device((*d).clone()));
        Ok(MeshClient::new(Arc::new(transport), config)?)
    }

    async fn connect(client: &MeshClient, device: &SimulatedDevice) -> Result<SessionManager> {
        let found = client.scan(Duration::from_millis(100)).await?;
        let target = found
            .into_iter()
            .find(|d| &d.transport_id == device.transport_id())
            .context("Simulated device not discovered")?;
        Ok(client.connect(&target).await?)
    }

    async fn wait_for_state(session: &SessionManager, state: SessionState) -> bool {
        for _ in 0..100 {
            if session.state().await == state {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_handshake_with_primary_credentials() -> Result<()> {
        let device = SimulatedDevice::new("lamp", 0x0031, &MeshIdentity::urbarn());
        let client = client_for(&[&device], fast_config())?;

        let session = tokio::time::timeout(Duration::from_secs(1), connect(&client, &device))
            .await
            .context("Handshake did not finish in time")??;

        assert_eq!(session.state().await, SessionState::Authenticated);
        assert_eq!(
            session.identity().await.map(|i| i.name().to_string()),
            Some("URBARN".to_string())
        );
        assert_eq!(device.login_count().await, 1);

        let received = device.received().await;
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].sequence, 0);
        assert!(matches!(received[0].command, Command::Login { .. }));

        let roster = client.devices().await;
        assert!(roster[0].is_authenticated);
        Ok(())
    }

    #[tokio::test]
    async fn test_wrong_credentials_fall_back_to_secondary() -> Result<()> {
        let device = SimulatedDevice::new("strip", 0x0032, &MeshIdentity::fulife());
        let client = client_for(&[&device], fast_config())?;

        let session = connect(&client, &device).await?;

        assert_eq!(session.state().await, SessionState::Authenticated);
        assert_eq!(
            session.identity().await.map(|i| i.name().to_string()),
            Some("Fulife".to_string())
        );
        // The URBARN login was refused, the Fulife one accepted
        assert_eq!(device.rejected().await, 1);
        assert_eq!(device.login_count().await, 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_unknown_mesh_fails_closed() -> Result<()> {
        let identity = MeshIdentity::new("Neighbour", "0000")?;
        let device = SimulatedDevice::new("other", 0x0033, &identity).with_name(Some("URBARN x"));
        let client = client_for(&[&device], fast_config())?;

        let result = connect(&client, &device).await;
        let error = result.err().context("Login should have failed")?;
        assert!(matches!(
            error.downcast_ref::<MeshError>(),
            Some(MeshError::Authentication(_))
        ));
        assert_eq!(device.rejected().await, 2);
        assert_eq!(device.login_count().await, 0);
        assert!(!device.is_connected().await);
        Ok(())
    }

    #[tokio::test]
    async fn test_set_power_advances_sequence_by_one() -> Result<()> {
        let device = SimulatedDevice::new("lamp", 0x0034, &MeshIdentity::urbarn());
        let client = client_for(&[&device], fast_config())?;
        let session = connect(&client, &device).await?;

        light::set_power(&session, false).await?;
        let previous = session.last_sequence().await.context("No frame sent")?;

        light::set_power(&session, true).await?;
        let received = device.received().await;
        let last = received.last().context("Fixture received nothing")?;
        assert_eq!(last.command, Command::Power(true));
        assert_eq!(last.sequence, previous + 1);
        assert!(device.status().await.on);

        let written = device.written().await;
        let frame = decode_frame(written.last().context("Nothing written")?)?;
        assert_eq!(frame.opcode, Opcode::POWER);
        assert_eq!(frame.sequence, previous + 1);
        assert_eq!(frame.mesh_address, 0x0034);
        Ok(())
    }

    #[tokio::test]
    async fn test_brightness_color_and_status() -> Result<()> {
        let device = SimulatedDevice::new("lamp", 0x0035, &MeshIdentity::urbarn());
        let client = client_for(&[&device], fast_config())?;
        let session = connect(&client, &device).await?;

        light::set_power(&session, true).await?;
        light::set_brightness(&session, 40).await?;
        light::set_color(&session, Rgb::new(0xff, 0x40, 0x00)).await?;

        let status = light::query_status(&session).await?;
        assert_eq!(
            status,
            LightStatus {
                on: true,
                brightness: 40,
                color: Rgb::new(0xff, 0x40, 0x00),
            }
        );

        let sequences: Vec<u32> = device.received().await.iter().map(|r| r.sequence).collect();
        assert_eq!(sequences, [0, 1, 2, 3, 4]);

        let roster = client.devices().await;
        assert_eq!(roster[0].status, Some(status));
        Ok(())
    }

    #[tokio::test]
    async fn test_brightness_out_of_range_sends_nothing() -> Result<()> {
        let device = SimulatedDevice::new("lamp", 0x0036, &MeshIdentity::urbarn());
        let client = client_for(&[&device], fast_config())?;
        let session = connect(&client, &device).await?;

        let result = light::set_brightness(&session, 101).await;
        assert!(matches!(result, Err(MeshError::InvalidArgument(_))));
        assert_eq!(device.written().await.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_three_decode_failures_force_unauthenticated() -> Result<()> {
        let device = SimulatedDevice::new("lamp", 0x0037, &MeshIdentity::urbarn());
        let mut config = fast_config();
        config.session.rehandshake_attempts = 0;
        let client = client_for(&[&device], config)?;
        let session = connect(&client, &device).await?;

        device.corrupt_replies(3).await;
        let result = light::set_power(&session, true).await;
        assert!(matches!(result, Err(MeshError::Authentication(_))));
        assert_eq!(session.state().await, SessionState::Unauthenticated);
        assert_eq!(session.stats().await.invalidations, 1);

        // The next command logs in again before sending
        light::set_power(&session, false).await?;
        assert_eq!(session.state().await, SessionState::Authenticated);
        assert_eq!(device.login_count().await, 2);
        assert_eq!(session.last_sequence().await, Some(1));
        Ok(())
    }

    #[tokio::test]
    async fn test_decode_failures_recovered_within_one_command() -> Result<()> {
        let device = SimulatedDevice::new("lamp", 0x0038, &MeshIdentity::urbarn());
        let client = client_for(&[&device], fast_config())?;
        let session = connect(&client, &device).await?;

        device.corrupt_replies(3).await;
        light::set_power(&session, true).await?;

        assert_eq!(device.login_count().await, 2);
        let stats = session.stats().await;
        assert_eq!(stats.handshakes, 2);
        assert_eq!(stats.invalidations, 1);
        assert_eq!(stats.failures, 3);
        Ok(())
    }

    #[tokio::test]
    async fn test_frame_replayed_into_new_session_fails() -> Result<()> {
        let device = SimulatedDevice::new("lamp", 0x0039, &MeshIdentity::urbarn());
        let client = client_for(&[&device], fast_config())?;

        let first = connect(&client, &device).await?;
        light::set_power(&first, true).await?;
        let captured = device.written().await.last().cloned().context("Nothing written")?;
        client.disconnect(&first).await?;

        let second = connect(&client, &device).await?;
        let accepted = device.received().await.len();
        let rejected = device.rejected().await;

        device.inject(&captured).await;
        assert_eq!(device.received().await.len(), accepted);
        assert_eq!(device.rejected().await, rejected + 1);

        light::set_power(&second, false).await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_write_retries_absorb_transient_failures() -> Result<()> {
        let device = SimulatedDevice::new("lamp", 0x003a, &MeshIdentity::urbarn());
        let client = client_for(&[&device], fast_config())?;
        let session = connect(&client, &device).await?;

        device.fail_writes(2).await;
        light::set_power(&session, true).await?;
        assert_eq!(session.stats().await.write_retries, 2);
        assert!(device.status().await.on);
        Ok(())
    }

    #[tokio::test]
    async fn test_write_retry_exhaustion_surfaces_io_error() -> Result<()> {
        let device = SimulatedDevice::new("lamp", 0x003b, &MeshIdentity::urbarn());
        let mut config = fast_config();
        config.session.write_retries = 2;
        let client = client_for(&[&device], config)?;
        let session = connect(&client, &device).await?;

        device.fail_writes(10).await;
        let result = light::set_power(&session, true).await;
        assert!(matches!(result, Err(MeshError::Io(_))));
        assert_eq!(session.stats().await.write_retries, 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_missing_ack_is_retried() -> Result<()> {
        let device = SimulatedDevice::new("lamp", 0x003c, &MeshIdentity::urbarn());
        let client = client_for(&[&device], fast_config())?;
        let session = connect(&client, &device).await?;

        device.drop_acks(1).await;
        light::set_power(&session, true).await?;

        let powers = device
            .received()
            .await
            .into_iter()
            .filter(|r| r.command == Command::Power(true))
            .count();
        assert_eq!(powers, 2);
        assert_eq!(session.stats().await.failures, 1);
        assert_eq!(session.state().await, SessionState::Authenticated);
        Ok(())
    }

    #[tokio::test]
    async fn test_disconnect_aborts_in_flight_wait() -> Result<()> {
        let device = SimulatedDevice::new("lamp", 0x003d, &MeshIdentity::urbarn());
        let mut config = fast_config();
        config.session.ack_timeout_ms = 10_000;
        let client = client_for(&[&device], config)?;
        let session = connect(&client, &device).await?;

        device.drop_acks(1).await;
        let started = std::time::Instant::now();
        let (result, closed) = tokio::join!(light::set_power(&session, true), async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            session.disconnect().await
        });

        closed?;
        assert!(matches!(result, Err(MeshError::Cancelled)));
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(session.state().await, SessionState::Disconnected);

        let after = light::set_power(&session, true).await;
        assert!(matches!(after, Err(MeshError::Cancelled)));
        Ok(())
    }

    #[tokio::test]
    async fn test_link_loss_moves_to_disconnected() -> Result<()> {
        let device = SimulatedDevice::new("lamp", 0x003e, &MeshIdentity::urbarn());
        let client = client_for(&[&device], fast_config())?;
        let session = connect(&client, &device).await?;

        device.drop_link().await;
        assert!(wait_for_state(&session, SessionState::Disconnected).await);

        let result = light::set_power(&session, true).await;
        assert!(matches!(result, Err(MeshError::NotConnected)));
        assert!(!client.devices().await[0].is_authenticated);
        Ok(())
    }

    #[tokio::test]
    async fn test_unsolicited_status_updates_roster() -> Result<()> {
        let device = SimulatedDevice::new("lamp", 0x003f, &MeshIdentity::urbarn());
        let client = client_for(&[&device], fast_config())?;
        let session = connect(&client, &device).await?;

        let reported = LightStatus {
            on: true,
            brightness: 12,
            color: Rgb::new(0, 0, 0xff),
        };
        device.set_status(reported).await;
        assert!(device.push_status().await);

        let mut seen = None;
        for _ in 0..100 {
            seen = client.devices().await[0].status;
            if seen.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(seen, Some(reported));
        assert_eq!(session.last_status().await, Some(reported));
        Ok(())
    }

    #[tokio::test]
    async fn test_concurrent_sends_are_serialized() -> Result<()> {
        let device = SimulatedDevice::new("lamp", 0x0040, &MeshIdentity::urbarn());
        let client = client_for(&[&device], fast_config())?;
        let session = connect(&client, &device).await?;

        let (a, b, c, d) = tokio::join!(
            light::set_power(&session, true),
            light::set_brightness(&session, 10),
            light::set_brightness(&session, 20),
            light::set_color(&session, Rgb::new(1, 2, 3)),
        );
        a?;
        b?;
        c?;
        d?;

        let sequences: Vec<u32> = device.received().await.iter().map(|r| r.sequence).collect();
        assert_eq!(sequences, [0, 1, 2, 3, 4]);
        Ok(())
    }

    #[tokio::test]
    async fn test_independent_sessions_run_in_parallel() -> Result<()> {
        let lamp = SimulatedDevice::new("lamp", 0x0041, &MeshIdentity::urbarn());
        let strip = SimulatedDevice::new("strip", 0x0042, &MeshIdentity::fulife());
        let client = client_for(&[&lamp, &strip], fast_config())?;

        let lamp_session = connect(&client, &lamp).await?;
        let strip_session = connect(&client, &strip).await?;

        let (a, b) = tokio::join!(
            light::set_power(&lamp_session, true),
            light::set_power(&strip_session, true),
        );
        a?;
        b?;

        assert_eq!(lamp_session.last_sequence().await, Some(1));
        assert_eq!(strip_session.last_sequence().await, Some(1));
        assert!(lamp.status().await.on);
        assert!(strip.status().await.on);
        Ok(())
    }

    #[tokio::test]
    async fn test_connect_retries_then_drops_unreachable_device() -> Result<()> {
        let device = SimulatedDevice::new("lamp", 0x0043, &MeshIdentity::urbarn());
        let mut config = fast_config();
        config.session.connect_retries = 1;
        config.session.unreachable_budget = 2;
        let client = client_for(&[&device], config)?;
        let found = client.scan(Duration::from_millis(100)).await?;
        let target = found.first().context("Nothing discovered")?.clone();

        // One refusal is absorbed by the retry
        device.refuse_connects(1).await;
        let session = client.connect(&target).await?;
        session.disconnect().await?;

        device.refuse_connects(10).await;
        assert!(matches!(
            client.connect(&target).await,
            Err(MeshError::Connection(_))
        ));
        assert_eq!(client.devices().await.len(), 1);

        assert!(matches!(
            client.connect(&target).await,
            Err(MeshError::Connection(_))
        ));
        assert!(client.devices().await.is_empty());
        Ok(())
    }

    /// Answers every login with the same recorded acknowledgment
    struct ReplayingLink {
        id: TransportId,
        recorded: Vec<u8>,
        subscribers: std::sync::Mutex<Vec<mpsc::UnboundedSender<Vec<u8>>>>,
    }

    #[async_trait]
    impl Link for ReplayingLink {
        fn id(&self) -> &TransportId {
            &self.id
        }

        async fn write(&self, bytes: &[u8]) -> Result<(), TransportError> {
            let is_login = decode_frame(bytes).is_ok_and(|frame| frame.opcode == Opcode::LOGIN);
            if is_login {
                if let Ok(mut subscribers) = self.subscribers.lock() {
                    subscribers.retain(|tx| tx.send(self.recorded.clone()).is_ok());
                }
            }
            Ok(())
        }

        async fn subscribe(&self) -> Result<BoxStream<'static, Vec<u8>>, TransportError> {
            let (tx, rx) = mpsc::unbounded_channel();
            if let Ok(mut subscribers) = self.subscribers.lock() {
                subscribers.push(tx);
            }
            Ok(stream::unfold(rx, |mut rx| async move {
                rx.recv().await.map(|bytes| (bytes, rx))
            })
            .boxed())
        }

        async fn disconnect(&self) -> Result<(), TransportError> {
            if let Ok(mut subscribers) = self.subscribers.lock() {
                subscribers.clear();
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_recorded_login_ack_does_not_authenticate_a_new_login() -> Result<()> {
        let identity = MeshIdentity::urbarn();
        let device = SimulatedDevice::new("lamp", 0x0044, &identity);
        let transport = SimulatedTransport::new().with_device(device.clone());

        // A genuine acknowledgment, answering a login with a known nonce
        let client_nonce = [7u8; 8];
        let link = transport.connect(device.transport_id()).await?;
        let mut notifications = link.subscribe().await?;
        let login = seal_command(
            &identity.session_key().login_key(),
            device.mesh_address(),
            0,
            &Command::Login {
                nonce: client_nonce,
            },
        )?;
        link.write(&login).await?;
        let recorded = tokio::time::timeout(Duration::from_secs(1), notifications.next())
            .await?
            .context("Fixture did not answer the login")?;
        let reply_key = identity.session_key().login_reply_key(&client_nonce);
        let (_, reply) = open_command(&reply_key, &recorded)?;
        assert!(matches!(reply, Command::LoginAck { .. }));

        let replaying = Arc::new(ReplayingLink {
            id: device.transport_id().clone(),
            recorded,
            subscribers: std::sync::Mutex::new(Vec::new()),
        });
        let target = Device::new(device.mesh_address(), device.transport_id().clone());
        let roster = Arc::new(Mutex::new(Roster::new(3)));

        let result = SessionManager::establish(replaying, target, &fast_config(), roster).await;
        assert!(matches!(result, Err(MeshError::Authentication(_))));
        Ok(())
    }

    #[tokio::test]
    async fn test_idle_session_logs_in_again_after_invalidation() -> Result<()> {
        let device = SimulatedDevice::new("lamp", 0x0045, &MeshIdentity::urbarn());
        let client = client_for(&[&device], fast_config())?;
        let session = connect(&client, &device).await?;

        // Truncated frames, with no command in flight
        for _ in 0..3 {
            device.notify(&[0u8; 5]).await;
        }

        let mut logins = 0;
        for _ in 0..100 {
            logins = device.login_count().await;
            if logins == 2 && session.state().await == SessionState::Authenticated {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(logins, 2);
        assert_eq!(session.state().await, SessionState::Authenticated);
        let stats = session.stats().await;
        assert_eq!(stats.invalidations, 1);
        assert_eq!(stats.handshakes, 2);
        assert_eq!(session.last_sequence().await, None);

        light::set_power(&session, true).await?;
        assert_eq!(device.login_count().await, 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_broadcast_power_is_addressed_to_every_node() -> Result<()> {
        let device = SimulatedDevice::new("lamp", 0x0046, &MeshIdentity::urbarn());
        let client = client_for(&[&device], fast_config())?;
        let session = connect(&client, &device).await?;

        light::set_power_to(&session, BROADCAST_ADDRESS, true).await?;

        let written = device.written().await;
        let frame = decode_frame(written.last().context("Nothing written")?)?;
        assert_eq!(frame.opcode, Opcode::POWER);
        assert_eq!(frame.mesh_address, BROADCAST_ADDRESS);
        assert!(device.status().await.on);

        light::set_brightness_to(&session, BROADCAST_ADDRESS, 30).await?;
        assert_eq!(device.status().await.brightness, 30);
        Ok(())
    }

    #[tokio::test]
    async fn test_disconnect_all_closes_open_sessions() -> Result<()> {
        let lamp = SimulatedDevice::new("lamp", 0x0047, &MeshIdentity::urbarn());
        let strip = SimulatedDevice::new("strip", 0x0048, &MeshIdentity::fulife());
        let client = client_for(&[&lamp, &strip], fast_config())?;

        let lamp_session = connect(&client, &lamp).await?;
        let strip_session = connect(&client, &strip).await?;

        assert_eq!(client.disconnect_all().await?, 2);
        assert_eq!(lamp_session.state().await, SessionState::Disconnected);
        assert_eq!(strip_session.state().await, SessionState::Disconnected);
        assert!(!lamp.is_connected().await);
        assert!(!strip.is_connected().await);

        // Nothing left to close
        assert_eq!(client.disconnect_all().await?, 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_link_loss_counts_against_unreachable_budget() -> Result<()> {
        let device = SimulatedDevice::new("lamp", 0x0049, &MeshIdentity::urbarn());
        let mut config = fast_config();
        config.session.unreachable_budget = 1;
        let client = client_for(&[&device], config)?;
        let session = connect(&client, &device).await?;

        device.drop_link().await;
        assert!(wait_for_state(&session, SessionState::Disconnected).await);

        let mut remaining = 1;
        for _ in 0..100 {
            remaining = client.devices().await.len();
            if remaining == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(remaining, 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_write_exhaustion_counts_against_unreachable_budget() -> Result<()> {
        let device = SimulatedDevice::new("lamp", 0x004a, &MeshIdentity::urbarn());
        let mut config = fast_config();
        config.session.write_retries = 1;
        let client = client_for(&[&device], config)?;
        let session = connect(&client, &device).await?;

        device.fail_writes(10).await;
        let result = light::set_power(&session, true).await;
        assert!(matches!(result, Err(MeshError::Io(_))));

        let roster = client.devices().await;
        assert_eq!(roster[0].failures, 1);
        assert!(!roster[0].is_authenticated);
        Ok(())
    }
}
