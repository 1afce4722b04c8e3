use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use log::{info, warn, LevelFilter};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, RawFd};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use nix::sys::select::{select, FdSet};
use nix::sys::time::{TimeSpec, TimeVal};
use nix::sys::timerfd::{ClockId, Expiration, TimerFd, TimerFlags, TimerSetTimeFlags};

use clocksyncd::clock::{self, establish_frequency_ground_truth, ClockHandle};
use clocksyncd::error::TickOutcome;
use clocksyncd::leap::LeapCoordinator;
use clocksyncd::management::{ManagementClient, ManagementId, ManagementResponse, PortState};
use clocksyncd::node::{tick_phc_mode, Clock};
use clocksyncd::pps::{refine_with_phc, PpsReader};
use clocksyncd::servo::{LinregServo, PiServo, Servo};
use clocksyncd::sja1105::{self, Sja1105Registers, Sja1105Servo, Sja1105Spi, SpiDevice, StagingArea};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ServoKind {
    Pi,
    Linreg,
}

/// PHC/PPS clock synchronization daemon with SJA1105 external switch servo support.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Slave clock to discipline (device path or interface name). Defaults
    /// to the system wall clock.
    #[arg(short = 'c')]
    slave: Option<String>,

    /// Master clock (device path or interface name).
    #[arg(short = 's')]
    master: Option<String>,

    /// Master PPS device (enables PPS mode).
    #[arg(short = 'd')]
    pps_device: Option<String>,

    /// Servo algorithm.
    #[arg(short = 'E', value_enum, default_value = "pi")]
    servo: ServoKind,

    /// Proportional gain.
    #[arg(short = 'P', default_value_t = 0.7)]
    kp: f64,

    /// Integral gain.
    #[arg(short = 'I', default_value_t = 0.3)]
    ki: f64,

    /// Step threshold applied after the first sample, in seconds (0 disables).
    #[arg(short = 'S', default_value_t = 0.0)]
    step_threshold: f64,

    /// Step threshold applied only to the first sample, in seconds.
    #[arg(short = 'F', default_value_t = 0.00002)]
    first_step_threshold: f64,

    /// Update rate in Hz.
    #[arg(short = 'R', default_value_t = 1.0)]
    rate_hz: f64,

    /// Number of readings per offset estimate.
    #[arg(short = 'N', default_value_t = 5)]
    n_readings: usize,

    /// Forced slave-master offset in seconds (disables management refresh).
    #[arg(short = 'O')]
    forced_offset: Option<f64>,

    /// Sanity-check frequency limit in ppb.
    #[arg(short = 'L', default_value_t = 200_000_000)]
    freq_limit_ppb: i64,

    /// Statistics window size (0 disables summaries, emits raw samples per tick).
    #[arg(short = 'u', default_value_t = 0)]
    stats_window: usize,

    /// Wait for the management peer to reach MASTER/SLAVE before starting.
    #[arg(short = 'w')]
    wait_sync: bool,

    /// PTP management domain number.
    #[arg(short = 'n', default_value_t = 0)]
    domain: u8,

    /// Apply leap seconds via the servo instead of the kernel.
    #[arg(short = 'x')]
    servo_leap: bool,

    /// Log level (error, warn, info, debug, trace).
    #[arg(short = 'l', default_value = "info")]
    log_level: String,

    /// Also log to stderr.
    #[arg(short = 'm')]
    verbose_stderr: bool,

    /// Suppress syslog output.
    #[arg(short = 'q')]
    quiet_syslog: bool,

    /// SPI device for an SJA1105-class external switch (enables the switch servo).
    #[arg(long = "sja1105-spi")]
    sja1105_spi: Option<String>,

    /// Static-configuration staging area blob, read to size the Qbv cycle.
    #[arg(long = "sja1105-staging")]
    sja1105_staging: Option<String>,

    /// SJA1105 ratio-space proportional gain.
    #[arg(long = "sja1105-kp", default_value_t = 0.1)]
    sja1105_kp: f64,

    /// SJA1105 ratio-space integral gain.
    #[arg(long = "sja1105-ki", default_value_t = 0.01)]
    sja1105_ki: f64,

    /// SJA1105 step/reset threshold in microseconds.
    #[arg(long = "sja1105-max-offset-us", default_value_t = 1000)]
    sja1105_max_offset_us: i64,

    /// SJA1105 SPI bus speed in Hz.
    #[arg(long = "sja1105-speed-hz", default_value_t = 1_000_000)]
    sja1105_speed_hz: u32,
}

struct CombinedLogger {
    stderr: Option<env_logger::Logger>,
    syslog: Option<syslog::BasicLogger>,
}

impl log::Log for CombinedLogger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        self.stderr.as_ref().map_or(false, |l| l.enabled(metadata))
            || self.syslog.as_ref().map_or(false, |l| l.enabled(metadata))
    }

    fn log(&self, record: &log::Record) {
        if let Some(l) = &self.stderr {
            l.log(record);
        }
        if let Some(l) = &self.syslog {
            l.log(record);
        }
    }

    fn flush(&self) {
        if let Some(l) = &self.stderr {
            l.flush();
        }
    }
}

fn init_logging(args: &Args) -> Result<()> {
    let level = LevelFilter::from_str(&args.log_level).unwrap_or(LevelFilter::Info);

    let stderr = if args.verbose_stderr {
        Some(
            env_logger::Builder::new()
                .filter_level(level)
                .format_timestamp_millis()
                .build(),
        )
    } else {
        None
    };

    let syslog_logger = if args.quiet_syslog {
        None
    } else {
        let formatter = syslog::Formatter3164 {
            facility: syslog::Facility::LOG_DAEMON,
            hostname: None,
            process: "clocksyncd".into(),
            pid: std::process::id(),
        };
        match syslog::unix(formatter) {
            Ok(writer) => Some(syslog::BasicLogger::new(writer)),
            Err(e) => {
                eprintln!("clocksyncd: failed to connect to syslog, continuing without it: {e}");
                None
            }
        }
    };

    log::set_max_level(level);
    log::set_boxed_logger(Box::new(CombinedLogger {
        stderr,
        syslog: syslog_logger,
    }))
    .context("installing logger")?;
    Ok(())
}

fn build_servo(args: &Args) -> Box<dyn Servo> {
    let step_ns = (args.step_threshold * 1.0e9) as i64;
    let first_step_ns = (args.first_step_threshold * 1.0e9) as i64;
    match args.servo {
        ServoKind::Pi => Box::new(PiServo::new(args.kp, args.ki, step_ns, first_step_ns)),
        ServoKind::Linreg => Box::new(LinregServo::new(args.n_readings.max(2), step_ns)),
    }
}

fn now_ns() -> i128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as i128
}

/// Blocks until the management peer reports MASTER or SLAVE port state, per
/// `-w`. Bounded by a 5-minute deadline; each unmatched response re-issues
/// the request.
fn wait_for_port_sync(client: &mut ManagementClient, domain: u8) -> Result<()> {
    let _ = domain;
    info!("waiting for management peer to reach MASTER/SLAVE port state");
    let deadline = Instant::now() + Duration::from_secs(300);
    loop {
        if Instant::now() > deadline {
            bail!("timed out waiting for management peer port state");
        }
        client.request(ManagementId::PortDataSet)?;
        client.clear_if_timed_out();
        std::thread::sleep(Duration::from_millis(200));
        if let Some(ManagementResponse::PortDataSet(state)) = client.poll_response()? {
            match state {
                PortState::Master | PortState::Slave => return Ok(()),
                other => {
                    info!("management peer port state is {other:?}, still waiting");
                }
            }
        }
    }
}

/// The External Switch Servo's state plus the timer descriptor that paces
/// it, owned by the main loop and drained from the same event loop as the
/// management-channel descriptor (§5) — no worker thread, no lock.
struct Sja1105Task {
    servo: Sja1105Servo<Sja1105Spi>,
    host: Box<dyn ClockHandle>,
    timer: TimerFd,
}

impl Sja1105Task {
    fn fd(&self) -> RawFd {
        self.timer.as_fd().as_raw_fd()
    }

    /// Drains one or more pending expirations and runs the equivalent
    /// number of servo ticks, called only once `fd()` has shown readable.
    fn service(&mut self) {
        match self.timer.wait() {
            Ok(()) => {
                if let Err(e) = self.servo.tick(self.host.as_ref()) {
                    warn!("switch servo tick failed: {e:#}");
                }
            }
            Err(nix::errno::Errno::EAGAIN) => {}
            Err(e) => warn!("switch servo timer read failed: {e}"),
        }
    }
}

/// Opens the SJA1105 register block, parses its staging area (if given),
/// and arms a 125ms (8Hz) `timerfd` to pace it — no thread, no shared
/// mutable state, just one more descriptor in the main select() set.
fn build_sja1105_task(args: &Args) -> Result<Option<Sja1105Task>> {
    let Some(spi_path) = &args.sja1105_spi else {
        return Ok(None);
    };

    let staging = match &args.sja1105_staging {
        Some(path) => {
            let blob =
                std::fs::read(path).with_context(|| format!("reading staging area {path}"))?;
            sja1105::parse_staging_area(&blob)?
        }
        None => StagingArea {
            have_qbv: false,
            slot_deltas: Vec::new(),
        },
    };

    let host_spec = args
        .master
        .clone()
        .unwrap_or_else(|| "CLOCK_REALTIME".to_string());
    let host = clock::open_clock(&host_spec).context("opening host clock for switch servo")?;

    let spi = SpiDevice::open(spi_path, args.sja1105_speed_hz, 8).context("opening SJA1105 SPI device")?;
    let regs = Sja1105Spi::new(spi);
    let servo = Sja1105Servo::new(
        regs,
        args.sja1105_kp,
        args.sja1105_ki,
        args.sja1105_max_offset_us,
        &staging,
    );

    let timer = TimerFd::new(ClockId::CLOCK_MONOTONIC, TimerFlags::TFD_NONBLOCK)
        .context("creating switch servo timer")?;
    let period = TimeSpec::from_duration(Duration::from_millis(125));
    timer
        .set(Expiration::Interval(period), TimerSetTimeFlags::empty())
        .context("arming switch servo timer")?;

    Ok(Some(Sja1105Task { servo, host, timer }))
}

fn run(args: Args, shutdown: Arc<AtomicBool>) -> Result<()> {
    let pps_mode = args.pps_device.is_some();

    let mut sja1105 = build_sja1105_task(&args)?;

    let mut master = match (&args.master, &args.pps_device) {
        (Some(path), _) => clock::open_clock(path).context("opening master clock")?,
        (None, Some(_)) => Box::new(clock::SystemClock::open()?) as Box<dyn ClockHandle>,
        (None, None) => bail!("at least one of -s (master clock) or -d (master PPS device) is required"),
    };
    establish_frequency_ground_truth(master.as_mut()).ok();

    let slave_spec = args.slave.clone().unwrap_or_else(|| "CLOCK_REALTIME".to_string());
    let slave_handle = clock::open_clock(&slave_spec).context("opening slave clock")?;

    let mut management = ManagementClient::connect("/var/run/clocksyncd", "/var/run/phc2sys")
        .map_err(|e| warn!("management channel unavailable: {e:#}"))
        .ok();

    if args.wait_sync {
        if let Some(client) = management.as_mut() {
            wait_for_port_sync(client, args.domain)?;
        } else {
            bail!("-w requires a reachable management channel");
        }
    }

    let forced_offset = args.forced_offset.map(|secs| secs.round() as i32);
    let mut leap = LeapCoordinator::new(forced_offset);

    let mut slave = Clock::new(slave_handle, build_servo(&args), args.freq_limit_ppb, args.stats_window);

    let tick_interval_ns = (1.0e9 / args.rate_hz.max(0.001)) as i64;

    let result = if pps_mode {
        run_pps_loop(master.as_mut(), &mut slave, &mut leap, &mut sja1105, &args, &shutdown)
    } else {
        run_phc_loop(
            master.as_ref(),
            &mut slave,
            &mut leap,
            &mut management,
            &mut sja1105,
            &args,
            tick_interval_ns,
            &shutdown,
        )
    };

    shutdown.store(true, Ordering::Relaxed);
    result
}

/// Waits up to `timeout` for any of `fds` to become readable, returning a
/// same-length `true`/`false` vector. The single multiplexing point shared
/// by PHC-mode and PPS-mode: the main tick source (a timer or the PPS
/// device) and the optional switch-servo timer and management descriptor
/// are all just descriptors in one `select()` set, per §5 — no worker
/// thread services any of them.
fn select_readable(fds: &[RawFd], timeout: Duration) -> Result<Vec<bool>> {
    let mut set = FdSet::new();
    for &fd in fds {
        set.insert(unsafe { BorrowedFd::borrow_raw(fd) });
    }
    let mut tv = TimeVal::new(timeout.as_secs() as i64, timeout.subsec_micros() as i64);
    match select(None, &mut set, None, None, &mut tv) {
        Ok(_) => {}
        Err(nix::errno::Errno::EINTR) => {}
        Err(e) => return Err(e).context("select() on event loop descriptors"),
    }
    Ok(fds
        .iter()
        .map(|&fd| set.contains(unsafe { BorrowedFd::borrow_raw(fd) }))
        .collect())
}

fn run_phc_loop(
    master: &dyn ClockHandle,
    slave: &mut Clock,
    leap: &mut LeapCoordinator,
    management: &mut Option<ManagementClient>,
    sja1105: &mut Option<Sja1105Task>,
    args: &Args,
    tick_interval_ns: i64,
    shutdown: &Arc<AtomicBool>,
) -> Result<()> {
    let tick_timer = TimerFd::new(ClockId::CLOCK_MONOTONIC, TimerFlags::TFD_NONBLOCK)
        .context("creating main tick timer")?;
    let period = TimeSpec::from_duration(Duration::from_nanos(tick_interval_ns.max(1) as u64));
    tick_timer
        .set(Expiration::Interval(period), TimerSetTimeFlags::empty())
        .context("arming main tick timer")?;

    while !shutdown.load(Ordering::Relaxed) {
        let mut fds = vec![tick_timer.as_fd().as_raw_fd()];
        let sja_idx = sja1105.as_ref().map(|t| {
            fds.push(t.fd());
            fds.len() - 1
        });
        let mgmt_idx = management.as_ref().map(|c| {
            fds.push(c.fd());
            fds.len() - 1
        });

        let ready = select_readable(&fds, Duration::from_millis(200))?;

        if let Some(idx) = mgmt_idx {
            if ready[idx] {
                if let Some(client) = management.as_mut() {
                    refresh_leap_from_management(client, leap);
                }
            }
        }
        if let Some(idx) = sja_idx {
            if ready[idx] {
                if let Some(task) = sja1105.as_mut() {
                    task.service();
                }
            }
        }
        if ready[0] {
            match tick_timer.wait() {
                Ok(()) | Err(nix::errno::Errno::EAGAIN) => {}
                Err(e) => warn!("main tick timer read failed: {e}"),
            }
            if let Some(client) = management.as_mut() {
                refresh_leap_from_management(client, leap);
            }
            let outcome =
                tick_phc_mode(master, slave, leap, args.n_readings, tick_interval_ns, args.servo_leap);
            log_tick_outcome(&outcome);
        }
    }
    Ok(())
}

fn run_pps_loop(
    master: &mut dyn ClockHandle,
    slave: &mut Clock,
    leap: &mut LeapCoordinator,
    sja1105: &mut Option<Sja1105Task>,
    args: &Args,
    shutdown: &Arc<AtomicBool>,
) -> Result<()> {
    let pps_path = args.pps_device.as_ref().expect("pps mode requires -d");
    let pps = PpsReader::open(pps_path).context("opening PPS device")?;
    let has_phc_master = args.master.is_some();
    if !has_phc_master {
        leap.sync_offset = 0;
    }

    while !shutdown.load(Ordering::Relaxed) {
        let mut fds = vec![pps.fd()];
        let sja_idx = sja1105.as_ref().map(|t| {
            fds.push(t.fd());
            fds.len() - 1
        });

        let ready = select_readable(&fds, Duration::from_millis(200))?;

        if let Some(idx) = sja_idx {
            if ready[idx] {
                if let Some(task) = sja1105.as_mut() {
                    task.service();
                }
            }
        }
        if !ready[0] {
            continue;
        }

        let (pps_ts_ns, residual) = match pps.fetch() {
            Ok(v) => v,
            Err(e) => {
                warn!("PPS fetch failed: {e}");
                continue;
            }
        };

        // The disciplined clock (`slave`) is the same wall clock that
        // timestamped the PPS edge, so its offset comes from the PPS
        // residual (no PHC) or from the PHC's own whole second combined
        // with the PPS edge (PHC present) — never from re-reading the
        // clock after the fact, which would measure read latency instead
        // of phase error.
        let (ts_ns, offset_ns) = if has_phc_master {
            match refine_with_phc(pps_ts_ns, master, slave.handle.as_ref()) {
                Ok(Some((ts, offset))) => (ts, offset),
                Ok(None) => {
                    warn!("PHC/PPS misaligned beyond limit, skipping sample");
                    continue;
                }
                Err(e) => {
                    warn!("PHC read failed during PPS refinement: {e}");
                    continue;
                }
            }
        } else {
            (pps_ts_ns, residual)
        };

        let estimate = clocksyncd::estimator::Estimate {
            offset_ns,
            ts_ns,
            delay_ns: 0,
        };

        let outcome = clocksyncd::node::apply_estimate(
            master,
            slave,
            leap,
            estimate,
            1_000_000_000,
            args.servo_leap,
        );
        log_tick_outcome(&outcome);
    }
    Ok(())
}

fn log_tick_outcome(outcome: &TickOutcome) {
    match outcome {
        TickOutcome::Applied | TickOutcome::Skip | TickOutcome::Reset => {}
        TickOutcome::Fatal(e) => warn!("tick failed: {e:#}"),
    }
}

fn refresh_leap_from_management(client: &mut ManagementClient, leap: &mut LeapCoordinator) {
    let now = now_ns();
    client.clear_if_timed_out();
    if leap.needs_refresh(now) {
        let _ = client.request(ManagementId::TimePropertiesDataSet);
    }
    if let Ok(Some(ManagementResponse::TimeProperties(tp))) = client.poll_response() {
        leap.apply_time_properties(now, tp.current_utc_offset, tp.ptp_timescale, tp.leap61, tp.leap59);
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args)?;

    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let shutdown = shutdown.clone();
        ctrlc::set_handler(move || {
            shutdown.store(true, Ordering::Relaxed);
        })
        .context("installing signal handler")?;
    }

    #[cfg(unix)]
    let _ = sd_notify::notify(false, &[sd_notify::NotifyState::Ready]);

    if let Err(e) = run(args, shutdown) {
        log::error!("fatal: {e:#}");
        std::process::exit(1);
    }
    Ok(())
}
