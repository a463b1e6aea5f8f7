use std::collections::HashSet;

use punchd::nonce::{constant_time_eq, Nonce};
use punchd::protocol::{Command, ProtocolError, ServerMessage, NONCE_LENGTH};

#[test]
fn test_parse_open() {
    let cmd = Command::parse("OPEN alice pw 8080").unwrap();
    assert_eq!(
        cmd,
        Command::Open {
            username: "alice".to_string(),
            password: "pw".to_string(),
            port: 8080,
        }
    );
}

#[test]
fn test_parse_tolerates_newline_and_extra_whitespace() {
    let cmd = Command::parse("OPEN  alice\tpw   8080\r\n").unwrap();
    assert!(matches!(cmd, Command::Open { port: 8080, .. }));

    assert_eq!(Command::parse("LIST\n").unwrap(), Command::List);
    assert_eq!(Command::parse("CLOSE\n").unwrap(), Command::Close);
}

#[test]
fn test_parse_open_wrong_arity() {
    let err = Command::parse("OPEN alice pw").unwrap_err();
    assert_eq!(
        err,
        ProtocolError::WrongArity {
            command: "OPEN".to_string(),
            expected: 3,
            got: 2,
        }
    );

    assert!(Command::parse("OPEN alice pw 8080 extra").is_err());
    assert!(Command::parse("LIST everything").is_err());
}

#[test]
fn test_parse_invalid_port() {
    assert!(matches!(
        Command::parse("OPEN alice pw http"),
        Err(ProtocolError::InvalidPort(_))
    ));
    assert!(matches!(
        Command::parse("OPEN alice pw 0"),
        Err(ProtocolError::InvalidPort(_))
    ));
    assert!(matches!(
        Command::parse("OPEN alice pw 65536"),
        Err(ProtocolError::InvalidPort(_))
    ));
}

#[test]
fn test_parse_unknown_and_empty() {
    assert_eq!(Command::parse("   \n").unwrap_err(), ProtocolError::Empty);
    assert!(matches!(
        Command::parse("open alice pw 8080"),
        Err(ProtocolError::UnknownCommand(_))
    ));
    assert!(matches!(
        Command::parse("GET / HTTP/1.1"),
        Err(ProtocolError::UnknownCommand(_))
    ));
}

#[test]
fn test_open_debug_redacts_password() {
    let cmd = Command::parse("OPEN alice hunter2 8080").unwrap();
    let rendered = format!("{:?}", cmd);
    assert!(rendered.contains("alice"));
    assert!(!rendered.contains("hunter2"));
}

#[test]
fn test_command_to_wire_parses_back() {
    let cmd = Command::Open {
        username: "bob".to_string(),
        password: "secret".to_string(),
        port: 2222,
    };
    assert_eq!(Command::parse(&cmd.to_wire()).unwrap(), cmd);
}

#[test]
fn test_server_message_wire_format() {
    assert_eq!(ServerMessage::Fail.to_bytes(), b"FAIL\n".to_vec());

    let msg = ServerMessage::connect(40123, "abcDEF123");
    assert_eq!(msg.to_bytes(), b"CONNECT 40123 abcDEF123\n".to_vec());
    assert_eq!(ServerMessage::parse("CONNECT 40123 abcDEF123\n").unwrap(), msg);
}

#[test]
fn test_server_message_parse_rejects_garbage() {
    assert!(ServerMessage::parse("CONNECT 40123").is_err());
    assert!(ServerMessage::parse("CONNECT port nonce").is_err());
    assert!(ServerMessage::parse("HELLO").is_err());
}

#[test]
fn test_nonce_length_and_alphabet() {
    let nonce = Nonce::generate(NONCE_LENGTH);
    assert_eq!(nonce.len(), NONCE_LENGTH);
    assert!(nonce.as_str().chars().all(|c| c.is_ascii_alphanumeric()));

    // Must survive a CONNECT round trip untouched
    let msg = ServerMessage::connect(1, nonce.as_str());
    match ServerMessage::parse(&msg.to_string()).unwrap() {
        ServerMessage::Connect { nonce: parsed, .. } => assert_eq!(parsed, nonce.as_str()),
        other => panic!("unexpected message: {:?}", other),
    }
}

#[test]
fn test_nonces_do_not_collide() {
    let mut seen = HashSet::new();
    for _ in 0..10_000 {
        let nonce = Nonce::generate(NONCE_LENGTH);
        assert!(seen.insert(nonce.as_str().to_string()), "nonce collision");
    }
}

#[test]
fn test_nonce_matches() {
    let nonce = Nonce::generate(32);
    assert!(nonce.matches(nonce.as_bytes()));
    assert!(!nonce.matches(&nonce.as_bytes()[..31]));

    let mut flipped = nonce.as_bytes().to_vec();
    flipped[31] ^= 0x01;
    assert!(!nonce.matches(&flipped));
}

#[test]
fn test_nonce_debug_hides_value() {
    let nonce = Nonce::generate(16);
    assert!(!format!("{:?}", nonce).contains(nonce.as_str()));
}

#[test]
fn test_constant_time_eq() {
    assert!(constant_time_eq(b"secret", b"secret"));
    assert!(!constant_time_eq(b"secret", b"secreT"));
    assert!(!constant_time_eq(b"secret", b"secret!"));
    assert!(constant_time_eq(b"", b""));
}
