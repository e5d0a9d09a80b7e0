//! The control process.
//!
//! Control accepts the clients of the control sockets and forwards
//! their commands to the manager; the replies come back already framed.

use super::{
    imsg::{Command, Handler, Message, PsId},
    Child,
};
use crate::{
    control::{Control, CtlFrame},
    eloop::Eloop,
    error::Error,
};
use log::{error, warn};
use std::rc::Rc;

/// Forward client commands and disconnects on the data channel.
pub fn proxy(control: &Control, data: Rc<Handler>) {
    control.set_proxy(Rc::new(move |cmd, frame: &CtlFrame| {
        data.send_message(cmd, 0, PsId::default(), frame)
    }));
}

/// Deliver a reply of the manager to its client.
pub fn handle(control: &Control, eloop: &mut Eloop, message: Message) {
    match message.command() {
        Ok(Command::Ctl) => {}
        Ok(cmd) => {
            warn!("control: unexpected {:?}", cmd);
            return;
        }
        Err(err) => {
            warn!("control: {}", err);
            return;
        }
    }
    let frame: CtlFrame = match message.decode() {
        Ok(frame) => frame,
        Err(err) => {
            error!("control: {}", err);
            return;
        }
    };
    if let Err(err) = control.deliver(eloop, frame.client, &frame.data) {
        warn!("control: client {}: {}", frame.client, err);
    }
}

/// Run the control process.
pub fn run_control(child: Child) -> Result<i32, Error> {
    let mut eloop = Eloop::new()?;
    let control = Control::new();

    // The sockets live outside of the chroot.
    control.listen(&mut eloop, &child.options.rundir, None, None)?;
    child.drop_privileges()?;

    proxy(&control, child.data.clone());
    let receiver = control.clone();
    child.watch(&mut eloop, move |eloop, message| {
        handle(&receiver, eloop, message)
    })?;

    let code = eloop.run();
    control.close(&mut eloop);
    Ok(code)
}
