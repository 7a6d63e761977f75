// Wire-level smoke test for the host.
//
// Starts a host on localhost and drives it with two plain TCP clients that
// speak the protocol crate's framing directly: join, roster, joined
// notification, relayed chat, game start and disconnect. No `Peer` code is
// involved, so this checks the host against the wire format alone.

use std::io::{BufReader, BufWriter, Write};
use std::net::{SocketAddr, TcpStream};
use std::time::{Duration, Instant};

use lifesim_protocol::{
    AttrValue, AttributeBag, LogicalTime, MAX_FRAME_SIZE, Message, read_frame, write_frame,
};
use lifesim_session::{GameClock, HostConfig, HostLock, Phase, start_host};

struct Client {
    reader: BufReader<TcpStream>,
    writer: BufWriter<TcpStream>,
}

impl Client {
    fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let reader = BufReader::new(stream.try_clone().unwrap());
        Client {
            reader,
            writer: BufWriter::new(stream),
        }
    }

    fn send(&mut self, msg: &Message) {
        write_frame(&mut self.writer, msg).unwrap();
        self.writer.flush().unwrap();
    }

    fn recv(&mut self) -> Message {
        read_frame(&mut self.reader).unwrap()
    }
}

fn wait_until(mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "condition not met in time");
        std::thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn full_lobby_lifecycle() {
    tracing_subscriber::fmt().with_test_writer().try_init().ok();

    let dir = tempfile::tempdir().unwrap();
    let config = HostConfig {
        port: 0,
        idle_timeout_ms: 20,
        lock_path: dir.path().join("server.lock"),
        ..HostConfig::default()
    };
    let lock = HostLock::acquire(&config.lock_path).unwrap();
    let host = start_host(&config, lock, GameClock::default()).unwrap();
    let addr = host.local_addr();

    // Aylin joins and gets a roster with only herself.
    let mut aylin = Client::connect(addr);
    let aylin_bag = AttributeBag::from([("money".to_owned(), AttrValue::Int(100))]);
    aylin.send(&Message::Join {
        name: "Aylin".into(),
        attributes: aylin_bag.clone(),
    });
    match aylin.recv() {
        Message::Roster { participants } => {
            assert_eq!(participants.len(), 1);
            assert_eq!(participants["Aylin"], aylin_bag);
        }
        other => panic!("expected Roster, got {other:?}"),
    }
    assert_eq!(host.participant_count(), 1);

    // Kerem joins; Aylin is told.
    let mut kerem = Client::connect(addr);
    kerem.send(&Message::Join {
        name: "Kerem".into(),
        attributes: AttributeBag::new(),
    });
    assert!(matches!(kerem.recv(), Message::Roster { participants } if participants.len() == 2));
    assert_eq!(
        aylin.recv(),
        Message::Joined {
            name: "Kerem".into(),
            attributes: AttributeBag::new(),
        }
    );

    // Chat from Kerem reaches Aylin only.
    let chat = Message::Chat {
        sender: "Kerem".into(),
        text: "merhaba".into(),
        at: LogicalTime(0),
    };
    kerem.send(&chat);
    assert_eq!(aylin.recv(), chat);

    // Two participants: the host may start.
    host.start_game("iyi oyunlar").unwrap();
    assert_eq!(host.phase(), Phase::Active);
    let start = Message::GameStart {
        host: "host".into(),
        message: "iyi oyunlar".into(),
    };
    assert_eq!(aylin.recv(), start);
    assert_eq!(kerem.recv(), start);

    // Kerem leaves; Aylin sees `left` and the host forgets him.
    drop(kerem);
    assert_eq!(aylin.recv(), Message::Left { name: "Kerem".into() });
    wait_until(|| host.participant_count() == 1);

    host.stop();
    assert!(!dir.path().join("server.lock").exists());
}

#[test]
fn malformed_frame_drops_only_the_offender() {
    tracing_subscriber::fmt().with_test_writer().try_init().ok();

    let dir = tempfile::tempdir().unwrap();
    let config = HostConfig {
        port: 0,
        idle_timeout_ms: 20,
        lock_path: dir.path().join("server.lock"),
        ..HostConfig::default()
    };
    let lock = HostLock::acquire(&config.lock_path).unwrap();
    let host = start_host(&config, lock, GameClock::default()).unwrap();

    let mut good = Client::connect(host.local_addr());
    good.send(&Message::Join {
        name: "Aylin".into(),
        attributes: AttributeBag::new(),
    });
    let _roster = good.recv();

    let mut bad = Client::connect(host.local_addr());
    bad.send(&Message::Join {
        name: "Deniz".into(),
        attributes: AttributeBag::new(),
    });
    let _roster = bad.recv();
    assert!(matches!(good.recv(), Message::Joined { .. }));

    bad.writer.write_all(&7u32.to_be_bytes()).unwrap();
    bad.writer.write_all(b"garbage").unwrap();
    bad.writer.flush().unwrap();

    assert_eq!(good.recv(), Message::Left { name: "Deniz".into() });
    wait_until(|| host.connection_count() == 1);
    assert_eq!(host.snapshot().keys().collect::<Vec<_>>(), vec!["Aylin"]);
}

#[test]
fn full_size_update_that_grows_when_relayed_drops_only_its_sender() {
    tracing_subscriber::fmt().with_test_writer().try_init().ok();

    let dir = tempfile::tempdir().unwrap();
    let config = HostConfig {
        port: 0,
        idle_timeout_ms: 20,
        lock_path: dir.path().join("server.lock"),
        ..HostConfig::default()
    };
    let lock = HostLock::acquire(&config.lock_path).unwrap();
    let host = start_host(&config, lock, GameClock::default()).unwrap();

    let mut names = ["Aylin", "Kerem", "Deniz"].map(|name| {
        let mut client = Client::connect(host.local_addr());
        client.send(&Message::Join {
            name: name.into(),
            attributes: AttributeBag::new(),
        });
        let _roster = client.recv();
        client
    });
    let [aylin, kerem, deniz] = &mut names;
    let _ = kerem.recv(); // Deniz joined
    let _ = aylin.recv(); // Kerem joined
    let _ = aylin.recv(); // Deniz joined

    // Exactly at the limit, with `replace` left out. Relaying it verbatim
    // would add `"replace":false` and push it over.
    let head = r#"{"type":"update","name":"Aylin","attributes":{"note":""#;
    let tail = r#""}}"#;
    let pad = MAX_FRAME_SIZE as usize - head.len() - tail.len();
    let payload = format!("{head}{}{tail}", "x".repeat(pad));
    assert_eq!(payload.len(), MAX_FRAME_SIZE as usize);
    aylin.writer.write_all(&MAX_FRAME_SIZE.to_be_bytes()).unwrap();
    aylin.writer.write_all(payload.as_bytes()).unwrap();
    aylin.writer.flush().unwrap();

    assert_eq!(kerem.recv(), Message::Left { name: "Aylin".into() });
    assert_eq!(deniz.recv(), Message::Left { name: "Aylin".into() });
    wait_until(|| host.connection_count() == 2);
    assert_eq!(
        host.snapshot().keys().collect::<Vec<_>>(),
        vec!["Deniz", "Kerem"]
    );
}
