use dhcpcd::{
    control::{encode_argv, socket_path, Control, CtlFrame, VERSION},
    eloop::{Eloop, Events, ALL_QUEUES},
    privsep::imsg::{Command, Handler, PsId},
};
use std::{
    io::{Read, Write},
    os::unix::{io::AsRawFd, net::UnixStream},
    rc::Rc,
};

fn run_once(eloop: &mut Eloop) {
    eloop
        .add_timeout(ALL_QUEUES, 0, 100_000_000, "control_test", 0, |eloop| {
            eloop.exit(0)
        })
        .unwrap();
    eloop.run();
}

fn version_reply() -> Vec<u8> {
    let mut reply = VERSION.as_bytes().to_vec();
    reply.push(0);
    reply
}

/// Read all messages of a channel and pass them to `f`.
fn watch<F>(eloop: &mut Eloop, handler: Rc<Handler>, mut f: F)
where
    F: FnMut(&mut Eloop, CtlFrame, Command) + 'static,
{
    let fd = handler.as_raw_fd();
    eloop
        .add_fd(fd, Events::READ, move |eloop, _| loop {
            match handler.recv_message().unwrap() {
                Some(message) => {
                    let cmd = message.command().unwrap();
                    f(eloop, message.decode().unwrap(), cmd)
                }
                None => {
                    eloop.delete_fd(fd).unwrap();
                    return;
                }
            }
            if !handler.has_pending() {
                return;
            }
        })
        .unwrap();
}

#[test]
fn test_version() {
    let dir = tempfile::tempdir().unwrap();
    let mut eloop = Eloop::new().unwrap();
    let control = Control::new();
    control.listen(&mut eloop, dir.path(), None, None).unwrap();

    let mut client = UnixStream::connect(socket_path(dir.path(), None, None, false)).unwrap();
    client.write_all(&encode_argv(&["--version"])).unwrap();
    run_once(&mut eloop);

    let mut buf = [0u8; 64];
    let length = client.read(&mut buf).unwrap();
    assert_eq!(&buf[..length], &version_reply()[..]);

    control.close(&mut eloop);
}

#[test]
fn test_relayed_version() {
    let dir = tempfile::tempdir().unwrap();
    let mut eloop = Eloop::new().unwrap();
    let (proxy_channel, manager_channel) = Handler::pair().unwrap();
    let proxy_channel = Rc::new(proxy_channel);
    let manager_channel = Rc::new(manager_channel);

    // The control process side.
    let proxy = Control::new();
    proxy.listen(&mut eloop, dir.path(), None, None).unwrap();
    proxy.set_proxy({
        let channel = proxy_channel.clone();
        Rc::new(move |cmd, frame: &CtlFrame| {
            channel.send_message(cmd, 0, PsId::default(), frame)
        })
    });
    watch(&mut eloop, proxy_channel, {
        let proxy = proxy.clone();
        move |eloop, frame, _| proxy.deliver(eloop, frame.client, &frame.data).unwrap()
    });

    // The manager side.
    let manager = Control::new();
    manager.set_relay({
        let channel = manager_channel.clone();
        Rc::new(move |client: u64, data: &[u8]| {
            let frame = CtlFrame {
                client,
                unprivileged: false,
                data: data.to_vec(),
            };
            channel.send_message(Command::Ctl, 0, PsId::default(), &frame)
        })
    });
    watch(&mut eloop, manager_channel, {
        let manager = manager.clone();
        move |eloop, frame, cmd| match cmd {
            Command::Ctl => manager.recv_relayed(eloop, &frame),
            Command::CtlEof => manager.drop_relayed(eloop, frame.client),
            _ => panic!("unexpected {:?}", cmd),
        }
    });

    let mut client = UnixStream::connect(socket_path(dir.path(), None, None, true)).unwrap();
    client.write_all(&encode_argv(&["--version"])).unwrap();
    for _ in 0..3 {
        run_once(&mut eloop);
    }

    // Relayed replies carry their length.
    let reply = version_reply();
    let mut expected = reply.len().to_ne_bytes().to_vec();
    expected.extend_from_slice(&reply);
    let mut buf = [0u8; 64];
    let length = client.read(&mut buf).unwrap();
    assert_eq!(&buf[..length], &expected[..]);

    // The manager forgets the client after it disconnected.
    drop(client);
    for _ in 0..3 {
        run_once(&mut eloop);
    }
    assert_eq!(proxy.client_count(), 0);
    assert_eq!(manager.client_count(), 0);

    proxy.close(&mut eloop);
}
