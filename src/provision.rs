//! Post-boot provisioning over the remote shell.
//!
//! The runner owns the reachability retry loop: emulated boot time is
//! unbounded and the emulator's exit status is deliberately not watched, so
//! the only readiness signal is a successful connection. Connection attempts
//! retry forever on a fixed interval.
//!
//! Scripts execute strictly sequentially in lexicographic order of their
//! guest paths; that sort is the only ordering guarantee, so scripts are
//! named to sort into their dependency order. Execution is best-effort: a
//! script's non-zero exit is reported and the sequence continues. A
//! transport failure mid-pass sends the machine back to `Connecting` and the
//! whole pass re-runs, so provisioning scripts are expected to be
//! idempotent.

use std::thread;
use std::time::Duration;

use anyhow::Result;

use crate::config::{DnsmasqParams, UsbMode};
use crate::remote::{Connector, ExecOutput, Session, SessionError};

/// Guest directory holding provisioning scripts.
pub const GUEST_SCRIPTS_DIR: &str = "/boot/scripts";

/// The gateway configuration script, gated by the dnsmasq feature flag and
/// the only script that receives positional arguments.
pub const DNSMASQ_SCRIPT: &str = "dnsmasq.sh";

const SHUTDOWN_COMMAND: &str = "sudo shutdown now";
const ENABLE_SERIAL_GETTY_COMMAND: &str = "sudo systemctl enable getty@ttyGS0.service";

const RETRY_INTERVAL: Duration = Duration::from_secs(10);
const SETTLE_PAUSE: Duration = Duration::from_secs(1);

/// Provisioning state machine. Transitions are logged; `Done` is reached
/// only through a completed pass ending in guest shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Connecting,
    Connected,
    Enumerating,
    RunningScripts,
    ShuttingDown,
    Done,
}

fn enter(phase: Phase) {
    log::debug!("provisioning phase: {phase:?}");
}

/// Summary of the completed provisioning pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProvisionReport {
    /// Scripts that ran, in execution order.
    pub executed: Vec<String>,
    /// Subset of `executed` that exited non-zero.
    pub failed: Vec<String>,
}

/// Connects to the booted guest and runs the scripts found in the image.
#[derive(Debug, Clone)]
pub struct ProvisionRunner {
    usb_mode: UsbMode,
    dnsmasq: Option<DnsmasqParams>,
    retry_interval: Duration,
    settle_pause: Duration,
}

impl ProvisionRunner {
    pub fn new(usb_mode: UsbMode, dnsmasq: Option<DnsmasqParams>) -> Self {
        Self {
            usb_mode,
            dnsmasq,
            retry_interval: RETRY_INTERVAL,
            settle_pause: SETTLE_PAUSE,
        }
    }

    /// Override the reconnect backoff interval.
    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    /// Override the pause after connecting and around shutdown.
    pub fn with_settle_pause(mut self, pause: Duration) -> Self {
        self.settle_pause = pause;
        self
    }

    /// Drive the state machine to completion. Unreachability and transport
    /// failures are never surfaced to the caller; the loop ends only after
    /// a full pass has shut the guest down.
    pub fn run<C: Connector>(&self, connector: &C) -> Result<ProvisionReport> {
        loop {
            enter(Phase::Connecting);
            let mut session = match connector.connect() {
                Ok(session) => session,
                Err(err) => {
                    log::debug!("guest not reachable yet: {err:#}");
                    thread::sleep(self.retry_interval);
                    continue;
                }
            };
            match self.provision(&mut session) {
                Ok(report) => return Ok(report),
                Err(err) => {
                    log::warn!("provisioning pass interrupted ({err}), reconnecting");
                    thread::sleep(self.retry_interval);
                }
            }
        }
    }

    /// One pass over a connected session: enumerate, run, shut down.
    fn provision<S: Session>(&self, session: &mut S) -> Result<ProvisionReport, SessionError> {
        enter(Phase::Connected);
        println!("Connected");
        thread::sleep(self.settle_pause);
        println!("Running scripts");
        if self.usb_mode == UsbMode::Serial {
            // The command's own success is irrelevant; the service may
            // already be enabled.
            exec_printed(session, ENABLE_SERIAL_GETTY_COMMAND)?;
        }

        enter(Phase::Enumerating);
        let listing = session.exec(&format!("/bin/ls -1p {GUEST_SCRIPTS_DIR}/*.sh"))?;
        let jobs = plan_scripts(&listing.stdout, self.dnsmasq.as_ref());

        enter(Phase::RunningScripts);
        let mut report = ProvisionReport::default();
        for job in &jobs {
            println!("Running {}", job.path);
            let output = exec_printed(session, &job.command())?;
            report.executed.push(job.path.clone());
            if output.exit_status != 0 {
                report.failed.push(job.path.clone());
            }
        }
        println!("Done");
        thread::sleep(self.settle_pause);

        enter(Phase::ShuttingDown);
        match session.exec(SHUTDOWN_COMMAND) {
            Ok(_) => {}
            // The guest powering off kills the connection out from under
            // us; that is the expected end of a clean pass.
            Err(SessionError::ConnectionClosed) => {
                log::debug!("guest closed the connection while shutting down");
            }
            Err(SessionError::Transport(err)) => {
                log::warn!("transport failure during shutdown: {err:#}");
            }
        }
        thread::sleep(self.settle_pause);

        enter(Phase::Done);
        Ok(report)
    }
}

/// One script to execute, with its positional arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ScriptJob {
    pub(crate) path: String,
    pub(crate) args: Vec<String>,
}

impl ScriptJob {
    fn command(&self) -> String {
        let mut command = format!("sudo /bin/bash {}", self.path);
        for arg in &self.args {
            command.push(' ');
            command.push_str(arg);
        }
        command
    }
}

/// Turn the raw enumeration output into an ordered execution plan: trim,
/// drop the dnsmasq script unless the feature is enabled, sort
/// lexicographically, and attach the gateway/range/lease arguments to the
/// dnsmasq script.
pub(crate) fn plan_scripts(listing: &str, dnsmasq: Option<&DnsmasqParams>) -> Vec<ScriptJob> {
    let mut paths = Vec::new();
    for line in listing.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if dnsmasq.is_none() && line.ends_with(&format!("/{DNSMASQ_SCRIPT}")) {
            println!("Skipping {DNSMASQ_SCRIPT}");
            continue;
        }
        paths.push(line.to_string());
    }
    paths.sort_unstable();
    paths
        .into_iter()
        .map(|path| {
            let args = match dnsmasq {
                Some(params) if path.ends_with(&format!("/{DNSMASQ_SCRIPT}")) => vec![
                    params.gateway.clone(),
                    params.range.clone(),
                    params.lease.clone(),
                ],
                _ => Vec::new(),
            };
            ScriptJob { path, args }
        })
        .collect()
}

/// Run a command and print whatever it wrote, the way an operator watching
/// the guest would see it.
fn exec_printed<S: Session>(session: &mut S, command: &str) -> Result<ExecOutput, SessionError> {
    let output = session.exec(command)?;
    for stream in [&output.stdout, &output.stderr] {
        if !stream.is_empty() {
            println!("{stream}");
        }
    }
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::{Cell, RefCell};
    use std::rc::Rc;

    const LISTING: &str = "/boot/scripts/z.sh\n/boot/scripts/a.sh\n/boot/scripts/dnsmasq.sh\n";

    fn dnsmasq_params() -> DnsmasqParams {
        DnsmasqParams {
            gateway: "10.20.30.1".to_string(),
            range: "10.20.30.2,10.20.30.40".to_string(),
            lease: "12h".to_string(),
        }
    }

    #[derive(Default)]
    struct FakeConnector {
        refusals: Cell<usize>,
        attempts: Cell<usize>,
        listing: String,
        log: Rc<RefCell<Vec<String>>>,
        /// Number of `exec` calls the first session survives before the
        /// connection drops; later sessions never drop.
        first_session_dies_after: Option<usize>,
        sessions: Cell<usize>,
        failing_script: Option<String>,
        closes_on_shutdown: bool,
    }

    impl FakeConnector {
        fn with_listing(listing: &str) -> Self {
            Self {
                listing: listing.to_string(),
                ..Self::default()
            }
        }

        fn commands(&self) -> Vec<String> {
            self.log.borrow().clone()
        }
    }

    impl Connector for FakeConnector {
        type Session = FakeSession;

        fn connect(&self) -> Result<FakeSession> {
            self.attempts.set(self.attempts.get() + 1);
            if self.refusals.get() > 0 {
                self.refusals.set(self.refusals.get() - 1);
                anyhow::bail!("connection refused");
            }
            self.sessions.set(self.sessions.get() + 1);
            let dies_after = if self.sessions.get() == 1 {
                self.first_session_dies_after
            } else {
                None
            };
            Ok(FakeSession {
                listing: self.listing.clone(),
                log: Rc::clone(&self.log),
                dies_after,
                failing_script: self.failing_script.clone(),
                closes_on_shutdown: self.closes_on_shutdown,
            })
        }
    }

    struct FakeSession {
        listing: String,
        log: Rc<RefCell<Vec<String>>>,
        dies_after: Option<usize>,
        failing_script: Option<String>,
        closes_on_shutdown: bool,
    }

    impl Session for FakeSession {
        fn exec(&mut self, command: &str) -> Result<ExecOutput, SessionError> {
            if let Some(remaining) = &mut self.dies_after {
                if *remaining == 0 {
                    return Err(SessionError::ConnectionClosed);
                }
                *remaining -= 1;
            }
            self.log.borrow_mut().push(command.to_string());
            if command.starts_with("/bin/ls") {
                return Ok(ExecOutput {
                    stdout: self.listing.clone(),
                    ..ExecOutput::default()
                });
            }
            if command == SHUTDOWN_COMMAND && self.closes_on_shutdown {
                return Err(SessionError::ConnectionClosed);
            }
            if let Some(script) = &self.failing_script {
                if command.contains(script.as_str()) {
                    return Ok(ExecOutput {
                        stderr: "boom".to_string(),
                        exit_status: 1,
                        ..ExecOutput::default()
                    });
                }
            }
            Ok(ExecOutput::default())
        }
    }

    fn runner(usb_mode: UsbMode, dnsmasq: Option<DnsmasqParams>) -> ProvisionRunner {
        ProvisionRunner::new(usb_mode, dnsmasq)
            .with_retry_interval(Duration::ZERO)
            .with_settle_pause(Duration::ZERO)
    }

    #[test]
    fn reconnects_until_the_guest_is_reachable() {
        let connector = FakeConnector::with_listing("");
        connector.refusals.set(3);
        let report = runner(UsbMode::None, None).run(&connector).unwrap();
        assert_eq!(connector.attempts.get(), 4);
        assert!(report.executed.is_empty());
    }

    #[test]
    fn scripts_run_sorted_with_dnsmasq_filtered_out() {
        let connector = FakeConnector::with_listing(LISTING);
        let report = runner(UsbMode::None, None).run(&connector).unwrap();
        assert_eq!(
            report.executed,
            vec!["/boot/scripts/a.sh", "/boot/scripts/z.sh"]
        );
        assert_eq!(
            connector.commands(),
            vec![
                "/bin/ls -1p /boot/scripts/*.sh",
                "sudo /bin/bash /boot/scripts/a.sh",
                "sudo /bin/bash /boot/scripts/z.sh",
                "sudo shutdown now",
            ]
        );
    }

    #[test]
    fn dnsmasq_script_kept_and_given_three_arguments() {
        let connector = FakeConnector::with_listing(LISTING);
        let report = runner(UsbMode::None, Some(dnsmasq_params()))
            .run(&connector)
            .unwrap();
        assert_eq!(
            report.executed,
            vec![
                "/boot/scripts/a.sh",
                "/boot/scripts/dnsmasq.sh",
                "/boot/scripts/z.sh",
            ]
        );
        assert!(connector.commands().contains(
            &"sudo /bin/bash /boot/scripts/dnsmasq.sh 10.20.30.1 10.20.30.2,10.20.30.40 12h"
                .to_string()
        ));
    }

    #[test]
    fn serial_mode_enables_getty_before_enumerating() {
        let connector = FakeConnector::with_listing("");
        runner(UsbMode::Serial, None).run(&connector).unwrap();
        let commands = connector.commands();
        assert_eq!(commands[0], ENABLE_SERIAL_GETTY_COMMAND);
        assert!(commands[1].starts_with("/bin/ls"));
    }

    #[test]
    fn failing_script_is_reported_but_does_not_halt_the_pass() {
        let mut connector = FakeConnector::with_listing(LISTING);
        connector.failing_script = Some("a.sh".to_string());
        let report = runner(UsbMode::None, None).run(&connector).unwrap();
        assert_eq!(report.failed, vec!["/boot/scripts/a.sh"]);
        assert_eq!(
            report.executed,
            vec!["/boot/scripts/a.sh", "/boot/scripts/z.sh"]
        );
    }

    #[test]
    fn connection_lost_mid_pass_reconnects_and_reruns() {
        let mut connector = FakeConnector::with_listing(LISTING);
        // First session survives the enumeration and one script, then dies.
        connector.first_session_dies_after = Some(2);
        let report = runner(UsbMode::None, None).run(&connector).unwrap();
        assert_eq!(connector.sessions.get(), 2);
        assert_eq!(
            report.executed,
            vec!["/boot/scripts/a.sh", "/boot/scripts/z.sh"]
        );
    }

    #[test]
    fn connection_closed_by_shutdown_is_a_clean_finish() {
        let mut connector = FakeConnector::with_listing(LISTING);
        connector.closes_on_shutdown = true;
        let report = runner(UsbMode::None, None).run(&connector).unwrap();
        assert_eq!(connector.sessions.get(), 1);
        assert_eq!(
            report.executed,
            vec!["/boot/scripts/a.sh", "/boot/scripts/z.sh"]
        );
    }

    #[test]
    fn plan_orders_lexicographically_and_gates_dnsmasq() {
        let listing = "/boot/scripts/z.sh\n/boot/scripts/a.sh\n/boot/scripts/dnsmasq.sh\n";
        let disabled = plan_scripts(listing, None);
        assert_eq!(
            disabled.iter().map(|job| job.path.as_str()).collect::<Vec<_>>(),
            vec!["/boot/scripts/a.sh", "/boot/scripts/z.sh"]
        );
        assert!(disabled.iter().all(|job| job.args.is_empty()));

        let params = dnsmasq_params();
        let enabled = plan_scripts(listing, Some(&params));
        assert_eq!(
            enabled.iter().map(|job| job.path.as_str()).collect::<Vec<_>>(),
            vec![
                "/boot/scripts/a.sh",
                "/boot/scripts/dnsmasq.sh",
                "/boot/scripts/z.sh",
            ]
        );
        assert_eq!(
            enabled[1].args,
            vec!["10.20.30.1", "10.20.30.2,10.20.30.40", "12h"]
        );
        assert_eq!(enabled[1].args.len(), 3);
    }
}
