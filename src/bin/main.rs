use anyhow::Context;
use clap::Parser;
use log::{info, warn};
use rplget::bpf;
use rplget::config::{
    parse_pps, parse_relative_time, Address, Mode, OutputFormat, PacketType, RunConfig, RunOption,
};
use rplget::driver::RunContext;
use rplget::flags::FlagSet;
use rplget::progress::{self, DEFAULT_PERIOD};
use rplget::report::RunReport;

#[derive(Parser)]
#[command(name = "rplget")]
#[command(about = "Packet latency, jitter and rate measurement tool", long_about = None)]
#[command(version)]
struct Cli {
    /// Run mode: rx-lat, tx-lat, echo-lat, pkt-gen, rtt or rx-rate
    #[arg(short, long)]
    mode: Mode,

    /// Packet type: udp, avtp, ptpl2, ptpl4, xdp_ptpl2 or raw_ptpl2
    #[arg(short = 't', long = "type")]
    packet_type: PacketType,

    /// Interface name
    #[arg(short = 'i', long = "if")]
    interface: Option<String>,

    /// IP or MAC address depending on the packet type
    #[arg(short, long)]
    address: Option<String>,

    /// UDP port; 319 and 320 select PTP payloads and the PTP multicast group
    #[arg(short = 'u', long = "udp")]
    port: Option<u16>,

    /// Number of packets to send or receive
    #[arg(short = 'n', long = "pkt-num")]
    pkt_num: Option<u64>,

    /// Total frame size in bytes
    #[arg(short = 'l', long)]
    frame_size: Option<usize>,

    /// Packets per second, fractional rates allowed
    #[arg(short = 's', long)]
    pps: Option<String>,

    /// Socket priority
    #[arg(short, long)]
    prio: Option<i32>,

    /// SO_BUSY_POLL time in microseconds
    #[arg(short = 'w', long)]
    busy_poll: Option<u32>,

    /// Baseline for "hwts" output instead of the first packet, in ns
    #[arg(short, long)]
    rel_time: Option<String>,

    /// Stream id carried in the PTP sequence id (0..=3)
    #[arg(short = 'k', long, default_value = "0")]
    stream_id: u8,

    /// Number of packet scheduler hops expected with the "sched" format
    #[arg(short, long, default_value = "0")]
    dev_deep: u32,

    /// Queue for the AF_XDP socket
    #[arg(short, long)]
    queue: Option<u32>,

    /// Force zero-copy AF_XDP mode
    #[arg(short, long)]
    zero_copy: bool,

    /// Comma separated printouts: hwts, ipgap, plain, lat, sched
    #[arg(short, long)]
    format: Option<String>,

    /// Comma separated options: dis_hwts, clock_check, progress, sw_poll
    #[arg(short, long)]
    option: Option<String>,

    /// Log clock information before the run
    #[arg(short, long)]
    clock_check: bool,

    /// Print the report as JSON
    #[arg(short = 'J', long)]
    json: bool,
}

impl Cli {
    fn into_config(self) -> anyhow::Result<RunConfig> {
        let mut config = RunConfig::new(self.mode, self.packet_type)
            .with_stream_id(self.stream_id)
            .with_dev_deep(self.dev_deep)
            .with_zero_copy(self.zero_copy);

        if let Some(interface) = self.interface {
            config = config.with_interface(interface);
        }
        if let Some(address) = self.address {
            config = config.with_address(Address::parse_for(self.packet_type, &address)?);
        }
        if let Some(port) = self.port {
            config = config.with_port(port);
        }
        if let Some(count) = self.pkt_num {
            config = config.with_packet_count(count);
        }
        if let Some(size) = self.frame_size {
            config = config.with_frame_size(size);
        }
        if let Some(pps) = self.pps {
            config = config.with_interval(parse_pps(&pps)?);
        }
        if let Some(prio) = self.prio {
            config = config.with_priority(prio);
        }
        if let Some(micros) = self.busy_poll {
            config = config.with_busy_poll(micros);
        }
        if let Some(rel_time) = self.rel_time {
            config = config.with_relative_time(parse_relative_time(&rel_time)?);
        }
        if let Some(queue) = self.queue {
            config = config.with_queue(queue);
        }
        if let Some(format) = self.format {
            config = config.with_formats(FlagSet::<OutputFormat>::parse_list(&format)?);
        }

        let mut options = match self.option {
            Some(list) => FlagSet::<RunOption>::parse_list(&list)?,
            None => FlagSet::new(),
        };
        if self.clock_check {
            options.insert(RunOption::ClockCheck);
        }

        Ok(config.with_options(options).validate()?)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let json = cli.json;
    let config = cli.into_config()?;

    info!(
        "rplget {} mode {} type {}",
        rplget::VERSION,
        config.mode,
        config.packet_type
    );

    let loader = bpf::default_loader();
    let mut ctx = RunContext::open(config.clone(), loader.as_ref())
        .context("failed to open transport")?;
    let cancel = ctx.cancellation_token().clone();

    let progress_task = config.has_option(RunOption::Progress).then(|| {
        tokio::spawn(progress::run_progress_task(
            ctx.counter(),
            config.packet_count,
            DEFAULT_PERIOD,
            cancel.clone(),
            progress::stderr_sink,
        ))
    });

    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Interrupted, finishing run");
                cancel.cancel();
            }
        }
    });

    let outcome = tokio::task::spawn_blocking(move || {
        let samples = ctx.run();
        let closed = ctx.close();
        (samples, closed)
    })
    .await
    .context("measurement thread panicked")?;

    cancel.cancel();
    if let Some(task) = progress_task {
        let _ = task.await;
        eprintln!();
    }

    let (samples, closed) = outcome;
    let samples = samples?;
    if let Err(e) = closed {
        warn!("Failed to close transport: {}", e);
    }

    let report = RunReport::build(&config, &samples);
    if json {
        println!("{}", report.to_json()?);
    } else {
        print!("{}", report);
    }

    Ok(())
}
