//! D-Bus bindings generated by [dbus-codegen-rust](https://github.com/diwic/dbus-rs/tree/master/dbus-codegen),
//! trimmed to the login1 members this crate consumes.
use dbus::arg;
use dbus::blocking;

pub trait OrgFreedesktopLogin1Manager {
    fn inhibit(
        &self,
        what: &str,
        who: &str,
        why: &str,
        mode: &str,
    ) -> Result<arg::OwnedFd, dbus::Error>;
}

impl<'a, T: blocking::BlockingSender, C: ::std::ops::Deref<Target = T>>
    OrgFreedesktopLogin1Manager for blocking::Proxy<'a, C>
{
    fn inhibit(
        &self,
        what: &str,
        who: &str,
        why: &str,
        mode: &str,
    ) -> Result<arg::OwnedFd, dbus::Error> {
        self.method_call(
            "org.freedesktop.login1.Manager",
            "Inhibit",
            (what, who, why, mode),
        )
        .and_then(|r: (arg::OwnedFd,)| Ok(r.0))
    }
}

#[derive(Debug)]
pub struct OrgFreedesktopLogin1ManagerPrepareForSleep {
    pub arg0: bool,
}

impl arg::AppendAll for OrgFreedesktopLogin1ManagerPrepareForSleep {
    fn append(&self, i: &mut arg::IterAppend) {
        arg::RefArg::append(&self.arg0, i);
    }
}

impl arg::ReadAll for OrgFreedesktopLogin1ManagerPrepareForSleep {
    fn read(i: &mut arg::Iter) -> Result<Self, arg::TypeMismatchError> {
        Ok(OrgFreedesktopLogin1ManagerPrepareForSleep { arg0: i.read()? })
    }
}

impl dbus::message::SignalArgs for OrgFreedesktopLogin1ManagerPrepareForSleep {
    const NAME: &'static str = "PrepareForSleep";
    const INTERFACE: &'static str = "org.freedesktop.login1.Manager";
}
