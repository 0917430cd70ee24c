use clap::{App, Arg};
use colored::*;
use std::time::Duration;
use tokio::time;
use tracing::{error, info, warn};
use twinode::hostlink::{decode_counter_report, encode_frame};
use twinode::{Clock, HostCommand, Mp2Rig, Mp2Slaves, NodeConfig, SatelliteRole};

const DEFAULT_TICKS: &str = "2000";
const HOST_PERIOD: u32 = 50;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let matches = App::new("twinode-sim")
        .version("0.1.0")
        .about("Brain and satellite nodes on a simulated two-wire bus")
        .arg(
            Arg::with_name("ticks")
                .short("t")
                .long("ticks")
                .value_name("TICKS")
                .help("Number of scheduler ticks to simulate")
                .takes_value(true)
                .default_value(DEFAULT_TICKS)
                .validator(|v| v.parse::<u32>().map(|_| ()).map_err(|_| "ticks must be a number".into())),
        )
        .arg(
            Arg::with_name("config")
                .short("c")
                .long("config")
                .value_name("FILE")
                .help("JSON node configuration")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("drop-device")
                .long("drop-device")
                .value_name("ADDRESS")
                .help("Disconnect the satellite at this bus address halfway through the run")
                .takes_value(true)
                .validator(|v| parse_address(&v).map(|_| ()).ok_or_else(|| "address must be 0..=0x7f".into())),
        )
        .arg(
            Arg::with_name("fast")
                .long("fast")
                .help("Advance the clock directly instead of waiting for real time"),
        )
        .get_matches();

    let config = match matches.value_of("config") {
        Some(path) => NodeConfig::load(path)?,
        None => NodeConfig::default(),
    };
    let ticks: u32 = matches.value_of("ticks").unwrap_or(DEFAULT_TICKS).parse()?;
    let drop_device = matches.value_of("drop-device").and_then(parse_address);
    let fast = matches.is_present("fast");

    println!("{}", "twinode simulator".bold());
    println!("==================");

    let clock = Clock::new();
    let slaves = Mp2Slaves::new(&config);
    let mut rig = Mp2Rig::new(&clock, &slaves, &config)?;

    let mut interval = time::interval(Duration::from_micros(config.tick_us));
    let mut reports = 0u32;
    let mut seq = 0u8;
    let mut encoder = [0u16; 4];

    for tick in 0..ticks {
        if fast {
            clock.advance(1);
        } else {
            tokio::select! {
                _ = interval.tick() => clock.on_overflow(),
                _ = tokio::signal::ctrl_c() => {
                    warn!("interrupted");
                    break;
                }
            }
        }

        if let Some(address) = drop_device.filter(|_| tick == ticks / 2) {
            warn!(address, "disconnecting device");
            rig.bus_mut().set_responsive(address, false);
        }

        if tick % HOST_PERIOD == 0 {
            seq = seq.wrapping_add(1);
            let frame = encode_frame(seq, &host_commands(tick))?;
            if let Err(e) = rig.brain_mut().push_host_frame(&frame) {
                warn!("host frame dropped: {}", e);
            }
        }

        if let Err(fault) = rig.run_pass() {
            let report = fault.report();
            error!("fatal fault {:#04x}: {}", report.code, fault);
            println!("{} {:02x?}", "FAULT".red().bold(), report.serial_frame());
            std::process::exit(i32::from(report.code));
        }

        while let Some(report) = rig.brain_mut().take_report() {
            if let Ok((report_seq, counters)) = decode_counter_report(&report) {
                reports += 1;
                info!(seq = report_seq, ?counters, "counter report");
            }
        }

        simulate_encoders(&mut rig, &mut encoder);
    }

    print_summary(&rig, ticks, reports);
    Ok(())
}

fn parse_address(text: &str) -> Option<u8> {
    let value = match text.strip_prefix("0x") {
        Some(hex) => u8::from_str_radix(hex, 16).ok()?,
        None => text.parse().ok()?,
    };
    (value <= 0x7F).then_some(value)
}

/// Slow motor ramp and a servo sweep, like a joystick moving back and forth.
fn host_commands(tick: u32) -> [HostCommand; 2] {
    let phase = (tick / HOST_PERIOD % 64) as u8;
    let power = 0x80u8.wrapping_add(phase).wrapping_sub(32);
    let servo = 1000 + u16::from(phase) * 16;
    [
        HostCommand::MotorSpeeds([power, 0xFFu8.wrapping_sub(power)]),
        HostCommand::ServoTimes([servo, servo, 3000 - servo, 3000 - servo]),
    ]
}

/// Wheels turn at the speed the motor board was last told, the counter
/// board counts the turns.
fn simulate_encoders(rig: &mut Mp2Rig<'_>, encoder: &mut [u16; 4]) {
    let Some(power) = rig.satellite(SatelliteRole::Motor).map(|motor| motor.motor_power()) else {
        return;
    };
    for (i, count) in encoder.iter_mut().enumerate() {
        let speed = i16::from(power[i % 2]) - 0x80;
        *count = count.wrapping_add((speed / 16) as u16);
    }
    if let Some(counters) = rig.satellite_mut(SatelliteRole::Counters) {
        counters.set_counters(*encoder);
    }
}

fn print_summary(rig: &Mp2Rig<'_>, ticks: u32, reports: u32) {
    let brain = rig.brain();
    let poller = brain.poller();
    let stats = poller.get_stats();

    println!();
    println!("{}", "Summary".bold());
    println!("  ticks simulated:   {}", ticks);
    println!("  final tick:        {}", rig.clock().read_timer());
    println!("  poll cycles:       {}", stats.cycles);
    println!("  phases completed:  {}", stats.completed_phases.to_string().green());
    let aborted = stats.aborted_phases.to_string();
    println!(
        "  phases aborted:    {}",
        if stats.aborted_phases == 0 { aborted.green() } else { aborted.red() }
    );
    println!("  bus reinits:       {}", stats.reinits);
    println!("  host reports:      {}", reports);
    println!("  host frame errors: {}", brain.get_stats().frame_errors);

    println!();
    println!("{}", "Devices".bold());
    for index in 0..poller.device_count() {
        let Some(device) = poller.device_config(index) else {
            continue;
        };
        let status = match poller.stale_since(index) {
            Some(since) => format!("stale since {}", since).red(),
            None => "ok".green(),
        };
        println!("  {:<10} {:#04x}  {}", device.name.as_str(), device.address, status);
    }

    println!();
    println!("  counters at brain: {:?}", brain.registers().counter_values);
    if let Some(motor) = rig.satellite(SatelliteRole::Motor) {
        println!("  motor satellite:   {:02x?}", motor.motor_power());
    }
    if let Some(servos) = rig.satellite(SatelliteRole::Servos) {
        println!("  servo satellite:   {:?}", servos.servo_times());
    }
}
