use dhcpcd::{
    eloop::{wait_fd, Events},
    net::Fd,
    privsep::imsg::{recv_ps_msg, Command, Handler, PsId, Reply, MAX_DATA},
    Error,
};
use nix::errno::Errno;
use std::{
    fs::File,
    io::{Read, Seek, SeekFrom, Write},
    os::unix::io::{AsRawFd, FromRawFd, IntoRawFd},
    thread,
};

/// Answer requests on a thread until the client hangs up.
fn server(handler: Handler) -> thread::JoinHandle<usize> {
    thread::spawn(move || {
        let mut count = 0;
        loop {
            let interest = if handler.has_queued() {
                Events::WRITE
            } else {
                Events::READ
            };
            let events = wait_fd(handler.as_raw_fd(), interest, None).unwrap();
            let open = recv_ps_msg(&handler, events, |message| {
                count += 1;
                match message.command()? {
                    Command::ReadFile => Ok(Reply::data(message.data.to_vec())),
                    Command::OpenLink => {
                        let mut file = tempfile::tempfile()?;
                        file.write_all(b"descriptor")?;
                        Ok(Reply::fd(Fd::from(file.into_raw_fd())))
                    }
                    _ => Err(Error::PermissionDenied),
                }
            })
            .unwrap();
            if !open {
                break count;
            }
        }
    })
}

#[test]
fn test_rpc_payloads() {
    let (client, remote) = Handler::pair().unwrap();
    let server = server(remote);

    for length in [0, 1, 1000, MAX_DATA / 2, MAX_DATA] {
        let data = (0..length).map(|i| i as u8).collect::<Vec<_>>();
        let result = client
            .rpc(Command::ReadFile, PsId::default(), &data)
            .unwrap()
            .into_result()
            .unwrap();
        assert_eq!(result.result, length as i64);
        assert_eq!(&result.data[..], &data[..], "payload of {} bytes", length);
    }

    drop(client);
    assert_eq!(server.join().unwrap(), 5);
}

#[test]
fn test_rpc_errors() {
    let (client, remote) = Handler::pair().unwrap();
    let server = server(remote);

    let result = client
        .rpc(Command::Script, PsId::default(), b"script")
        .unwrap();
    assert_eq!(result.result, -1);
    assert!(matches!(
        result.into_result(),
        Err(Error::UnixError(Errno::EPERM))
    ));

    // The channel is still in sync after an error.
    let result = client
        .rpc(Command::ReadFile, PsId::default(), b"next")
        .unwrap();
    assert_eq!(&result.data[..], b"next");

    drop(client);
    server.join().unwrap();
}

#[test]
fn test_rpc_descriptor() {
    let (client, remote) = Handler::pair().unwrap();
    let server = server(remote);

    let result = client
        .rpc(Command::OpenLink, PsId::default(), &[])
        .unwrap()
        .into_result()
        .unwrap();
    let fd = result.fd.expect("descriptor");
    let mut file = unsafe { File::from_raw_fd(fd.into_raw_fd()) };
    let mut data = String::new();
    file.seek(SeekFrom::Start(0)).unwrap();
    file.read_to_string(&mut data).unwrap();
    assert_eq!(data, "descriptor");

    drop(client);
    server.join().unwrap();
}
