//! The manager: protocol logic of the daemon.
//!
//! Every IPv4 address of the managed interfaces is announced and then
//! defended with ACD.  Address events are reported to the hook script,
//! through the root process, and to listening control clients.

use crate::{
    arp::{Arp, ArpCallback, ArpCallbacks, ArpKey, ArpMsg, LinkFactory, PacketLink, PrivsepLink},
    control::{Control, CtlFrame},
    eloop::Eloop,
    error::Error,
    interface::{hwaddr_ntoa, Interfaces},
    options::Options,
    privsep::{
        imsg::{Command, Message, PsId},
        Child, RootClient, RootDispatcher,
    },
};
use log::{debug, error, info, warn};
use nix::sys::signal::Signal;
use std::{
    cell::RefCell,
    fmt::Write,
    fs,
    net::Ipv4Addr,
    rc::{Rc, Weak},
};

struct Inner {
    options: Options,
    interfaces: Rc<RefCell<Interfaces>>,
    arp: Arp,
    control: Control,
    root: RootClient,
}

/// Shared handle to the manager state.
#[derive(Clone)]
pub struct Manager(Rc<Inner>);

impl Manager {
    pub fn new(options: Options, interfaces: Interfaces, links: LinkFactory, root: RootClient) -> Self {
        let interfaces = Rc::new(RefCell::new(interfaces));
        let manager = Self(Rc::new(Inner {
            options,
            arp: Arp::new(interfaces.clone(), links),
            interfaces,
            control: Control::new(),
            root,
        }));

        let weak = Rc::downgrade(&manager.0);
        manager.0.control.set_handler(Rc::new(
            move |eloop: &mut Eloop, control: &Control, client: u64, argv: &[String]| {
                let inner = weak.upgrade().ok_or(Error::NotFound)?;
                Manager(inner).command(eloop, control, client, argv)
            },
        ));

        manager
    }

    pub fn arp(&self) -> &Arp {
        &self.0.arp
    }

    pub fn control(&self) -> &Control {
        &self.0.control
    }

    /// Announce and defend all addresses.
    pub fn start(&self, eloop: &mut Eloop) {
        let addrs = self
            .0
            .interfaces
            .borrow()
            .iter()
            .flat_map(|iface| iface.addrs.iter().map(move |ia| (iface.index, ia.addr)))
            .collect::<Vec<_>>();

        for (ifindex, addr) in addrs {
            if let Err(err) = self.defend(eloop, ifindex, addr) {
                error!("{}: {}: {}", self.ifname(ifindex), addr, err);
            }
        }
    }

    /// Start ACD for an assigned address.
    pub fn defend(&self, eloop: &mut Eloop, ifindex: u32, addr: Ipv4Addr) -> Result<ArpKey, Error> {
        let arp = &self.0.arp;
        let key = arp.new_state(eloop, ifindex, addr)?;
        arp.set_callbacks(
            key,
            ArpCallbacks {
                found: Some(self.callback(Self::found)),
                not_found: None,
                defend_failed: Some(self.callback(Self::defend_failed)),
                announced: Some(self.callback(Self::announced)),
            },
        )?;
        arp.announce(eloop, key)?;
        Ok(key)
    }

    /// Handle a message routed by the root process.
    pub fn handle_message(&self, eloop: &mut Eloop, message: Message) {
        let result = match message.command() {
            Ok(Command::BpfArp) => {
                self.0
                    .arp
                    .handle_packet(eloop, message.header.id.ifindex, &message.data);
                Ok(())
            }
            Ok(Command::Ctl) => message
                .decode::<CtlFrame>()
                .map(|frame| self.0.control.recv_relayed(eloop, &frame)),
            Ok(Command::CtlEof) => message
                .decode::<CtlFrame>()
                .map(|frame| self.0.control.drop_relayed(eloop, frame.client)),
            Ok(cmd) => {
                warn!("manager: unexpected {:?}", cmd);
                Ok(())
            }
            Err(err) => Err(err),
        };
        if let Err(err) = result {
            error!("manager: {}", err);
        }
    }

    fn callback(&self, f: fn(&Self, &mut Eloop, ArpKey, Option<&ArpMsg>)) -> ArpCallback {
        let weak: Weak<Inner> = Rc::downgrade(&self.0);
        Rc::new(move |eloop: &mut Eloop, _: &Arp, key: ArpKey, msg: Option<&ArpMsg>| {
            if let Some(inner) = weak.upgrade() {
                f(&Manager(inner), eloop, key, msg)
            }
        })
    }

    fn announced(&self, eloop: &mut Eloop, key: ArpKey, _msg: Option<&ArpMsg>) {
        info!("{}: announced {}", self.ifname(key.ifindex), key.addr);
        self.event(eloop, "ARP_ANNOUNCED", key);
    }

    fn defend_failed(&self, eloop: &mut Eloop, key: ArpKey, _msg: Option<&ArpMsg>) {
        warn!("{}: lost address {}", self.ifname(key.ifindex), key.addr);
        self.event(eloop, "ARP_CONFLICT", key);
        self.0.arp.free(eloop, key);
    }

    fn found(&self, eloop: &mut Eloop, key: ArpKey, msg: Option<&ArpMsg>) {
        if let Some(msg) = msg {
            warn!(
                "{}: {} is in use by {}",
                self.ifname(key.ifindex),
                key.addr,
                hwaddr_ntoa(&msg.sha)
            );
        }
        self.0.arp.free(eloop, key);
    }

    /// Report an address event to listeners and the hook script.
    fn event(&self, eloop: &mut Eloop, reason: &str, key: ArpKey) {
        let ifname = self.ifname(key.ifindex);

        let mut line = format!("{} {} {}", ifname, reason, key.addr).into_bytes();
        line.push(0);
        self.0.control.broadcast(eloop, &line);

        if self.0.options.script.is_none() {
            return;
        }
        let env = vec![
            ("reason".to_string(), reason.to_string()),
            ("interface".to_string(), ifname.clone()),
            ("ip_address".to_string(), key.addr.to_string()),
        ];
        match self.0.root.script(&[], &env) {
            Ok(0) => debug!("{}: script {} done", ifname, reason),
            Ok(status) => warn!("{}: script {} exited with {}", ifname, reason, status),
            Err(err) => error!("{}: script {}: {}", ifname, reason, err),
        }
    }

    fn command(
        &self,
        eloop: &mut Eloop,
        control: &Control,
        client: u64,
        argv: &[String],
    ) -> Result<(), Error> {
        match argv[0].as_str() {
            "--getinterfaces" => {
                let mut reply = String::new();
                for iface in self.0.interfaces.borrow().iter() {
                    let _ = write!(reply, "{} {}", iface.name, hwaddr_ntoa(&iface.hwaddr));
                    for ia in &iface.addrs {
                        let _ = write!(reply, " {}/{}", ia.addr, ia.prefix_len);
                    }
                    reply.push('\n');
                }
                let mut reply = reply.into_bytes();
                reply.push(0);
                control.send(eloop, client, &reply)
            }
            "-k" | "--release" => {
                let ifname = argv.get(1).ok_or(Error::InvalidArgument("interface"))?;
                let ifindex = self
                    .0
                    .interfaces
                    .borrow()
                    .by_name(ifname)
                    .map(|iface| iface.index)
                    .ok_or(Error::NotFound)?;
                info!("{}: released", ifname);
                self.0.arp.drop_interface(eloop, ifindex);
                Ok(())
            }
            "-x" | "--exit" => {
                info!("manager: exit requested");
                eloop.exit(0);
                Ok(())
            }
            _ => Err(Error::NotSupported),
        }
    }

    fn ifname(&self, ifindex: u32) -> String {
        self.0
            .interfaces
            .borrow()
            .get(ifindex)
            .map(|iface| iface.name.clone())
            .unwrap_or_else(|| ifindex.to_string())
    }
}

/// Run the manager process.
pub fn run_manager(child: Child) -> Result<i32, Error> {
    let interfaces = Interfaces::discover(&child.options.interfaces)?;
    child.drop_privileges()?;

    let mut eloop = Eloop::new()?;
    let manager = Manager::new(
        child.options.clone(),
        interfaces,
        PrivsepLink::factory(child.data.clone()),
        RootClient::Remote(child.cmd.clone()),
    );

    // Replies are framed here, the control process delivers them as is.
    let data = child.data.clone();
    manager.control().set_relay(Rc::new(move |client: u64, reply: &[u8]| {
        let frame = CtlFrame {
            client,
            unprivileged: false,
            data: reply.to_vec(),
        };
        data.send_message(Command::Ctl, 0, PsId::default(), &frame)
    }));

    let receiver = manager.clone();
    child.watch(&mut eloop, move |eloop, message| {
        receiver.handle_message(eloop, message)
    })?;
    manager.start(&mut eloop);

    Ok(eloop.run())
}

/// Run all roles in a single process without privilege separation.
pub fn run_standalone(options: Options) -> Result<i32, Error> {
    fs::create_dir_all(&options.rundir)?;
    let interfaces = Interfaces::discover(&options.interfaces)?;

    let mut eloop = Eloop::new()?;
    let manager = Manager::new(
        options.clone(),
        interfaces,
        PacketLink::factory(),
        RootClient::Local(RootDispatcher::new(options.clone())),
    );
    manager
        .control()
        .listen(&mut eloop, &options.rundir, None, None)?;
    eloop.signal_handler(&[Signal::SIGTERM, Signal::SIGINT], |eloop, signal| {
        info!("received {}, stopping", signal);
        eloop.exit(0);
    })?;
    manager.start(&mut eloop);

    let code = eloop.run();
    manager.control().close(&mut eloop);
    Ok(code)
}
