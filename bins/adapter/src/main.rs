//! enip-adapter - sample EtherNet/IP adapter device
//!
//! Binds the encapsulation TCP/UDP ports, runs the stack engine on a
//! single-threaded runtime and mirrors consumed output data back into
//! the produced input assembly.

mod driver;

use std::net::{Ipv4Addr, SocketAddr};
use std::rc::Rc;
use std::time::Duration;

use clap::Parser;
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use enip::config::{ApplicationPath, AssemblyConfig, DeviceConfig, IdentityValues};
use enip::cip::types::Revision;
use enip::{Engine, TIMER_TICK_MS, UdpHandle};

use driver::{Event, TokioSocketDriver};

const INPUT_ASSEMBLY: u32 = 100;
const OUTPUT_ASSEMBLY: u32 = 150;
const CONFIG_ASSEMBLY: u32 = 151;
const INPUT_ONLY_HEARTBEAT: u32 = 152;
const LISTEN_ONLY_HEARTBEAT: u32 = 153;
const ASSEMBLY_SIZE: usize = 32;

#[derive(Parser)]
#[command(name = "enip-adapter")]
#[command(about = "Sample EtherNet/IP adapter device", long_about = None)]
#[command(version)]
struct Cli {
    /// Device IP address
    ip: Ipv4Addr,

    /// Network mask
    #[arg(long, default_value = "255.255.255.0")]
    netmask: Ipv4Addr,

    /// Default gateway
    #[arg(long, default_value = "0.0.0.0")]
    gateway: Ipv4Addr,

    /// Encapsulation port (TCP and UDP)
    #[arg(long, default_value_t = 0xAF12)]
    port: u16,

    /// UDP port for class-0/1 I/O data
    #[arg(long, default_value_t = 0x08AE)]
    io_port: u16,

    /// Serial number reported by the identity object
    #[arg(long, default_value_t = 0x00C0FFEE)]
    serial: u32,

    /// Device name reported by ListIdentity
    #[arg(long, default_value = "enip sample adapter")]
    name: String,
}

fn device_config(cli: &Cli) -> DeviceConfig {
    DeviceConfig {
        unique_connection_id: (cli.serial & 0xFFFF) as u16,
        ip_address: cli.ip,
        network_mask: cli.netmask,
        gateway: cli.gateway,
        host_name: "enip-adapter".into(),
        domain_name: String::new(),
        encapsulation_port: cli.port,
        io_port: cli.io_port,
        qos_dscp: 43,
        identity: IdentityValues {
            vendor_id: 0x0161,
            device_type: 0x0C, // communications adapter
            product_code: 0x0001,
            revision: Revision { major: 1, minor: 0 },
            status: 0,
            serial_number: cli.serial,
            product_name: cli.name.clone(),
        },
        assemblies: vec![
            AssemblyConfig {
                instance_id: INPUT_ASSEMBLY,
                size: ASSEMBLY_SIZE,
            },
            AssemblyConfig {
                instance_id: OUTPUT_ASSEMBLY,
                size: ASSEMBLY_SIZE,
            },
            AssemblyConfig {
                instance_id: CONFIG_ASSEMBLY,
                size: 10,
            },
            AssemblyConfig {
                instance_id: INPUT_ONLY_HEARTBEAT,
                size: 0,
            },
            AssemblyConfig {
                instance_id: LISTEN_ONLY_HEARTBEAT,
                size: 0,
            },
        ],
        exclusive_owner_paths: vec![ApplicationPath {
            output_assembly: OUTPUT_ASSEMBLY,
            input_assembly: INPUT_ASSEMBLY,
            config_assembly: CONFIG_ASSEMBLY,
        }],
        input_only_paths: vec![ApplicationPath {
            output_assembly: INPUT_ONLY_HEARTBEAT,
            input_assembly: INPUT_ASSEMBLY,
            config_assembly: CONFIG_ASSEMBLY,
        }],
        listen_only_paths: vec![ApplicationPath {
            output_assembly: LISTEN_ONLY_HEARTBEAT,
            input_assembly: INPUT_ASSEMBLY,
            config_assembly: CONFIG_ASSEMBLY,
        }],
    }
}

/// Sample application: logs connection events; data callbacks accept
/// everything.
#[derive(Debug, Default)]
struct SampleApplication;

impl enip::AdapterApplication for SampleApplication {
    fn after_assembly_data_received(&mut self, instance_id: u32) -> bool {
        debug!(instance_id, "assembly data received");
        true
    }

    fn before_assembly_data_send(&mut self, _instance_id: u32) -> bool {
        // mirrored data counts as changed whenever the output moved
        true
    }

    fn io_connection_event(
        &mut self,
        output_assembly: u32,
        input_assembly: u32,
        event: enip::IoConnectionEvent,
    ) {
        info!(output_assembly, input_assembly, ?event, "I/O connection event");
    }

    fn run_idle_changed(&mut self, run_idle: u32) {
        info!(run_idle, "run/idle header changed");
    }
}

fn main() -> std::io::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let local = tokio::task::LocalSet::new();
    local.block_on(&runtime, run(cli))
}

async fn run(cli: Cli) -> std::io::Result<()> {
    let config = device_config(&cli);
    let encap_port = config.encapsulation_port;

    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<Event>();

    let listener = TcpListener::bind(SocketAddr::from((cli.ip, encap_port))).await?;
    info!(%cli.ip, port = encap_port, "listening");

    // One UDP socket serves the encapsulation port. Without packet
    // info there is no way to tell unicast from broadcast here, so
    // every ListIdentity goes through the delayed (broadcast) path.
    let encap_udp = Rc::new({
        let socket = std::net::UdpSocket::bind(SocketAddr::from((
            Ipv4Addr::UNSPECIFIED,
            encap_port,
        )))?;
        socket.set_nonblocking(true)?;
        UdpSocket::from_std(socket)?
    });
    let encap_udp_handle = UdpHandle(0);
    {
        let socket = Rc::clone(&encap_udp);
        let tx = event_tx.clone();
        tokio::task::spawn_local(async move {
            let mut buf = vec![0u8; 65536];
            loop {
                match socket.recv_from(&mut buf).await {
                    Ok((len, SocketAddr::V4(origin))) => {
                        let _ = tx.send(Event::UdpEncap(buf[..len].to_vec(), origin));
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(error = %e, "encapsulation UDP receive failed");
                        break;
                    }
                }
            }
        });
    }

    let mut driver = TokioSocketDriver::new(event_tx.clone());
    driver.register_udp(encap_udp_handle, Rc::clone(&encap_udp));
    let mut engine = Engine::new(config, driver, SampleApplication);

    let mut tick = tokio::time::interval(Duration::from_millis(TIMER_TICK_MS as u64));
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Burst);

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        debug!(%peer, "TCP connection accepted");
                        engine.driver_mut().register_tcp(stream, peer);
                    }
                    Err(e) => warn!(error = %e, "accept failed"),
                }
            }
            event = event_rx.recv() => {
                let Some(event) = event else { break };
                match event {
                    Event::TcpFrame(handle, frame, origin) => {
                        if let Some(reply) =
                            engine.handle_explicit_tcp_data(handle, &frame, origin)
                        {
                            engine.driver_mut().send_tcp_reply(handle, reply);
                        }
                    }
                    Event::TcpClosed(handle) => {
                        engine.on_tcp_close(handle);
                        engine.driver_mut().forget_tcp(handle);
                    }
                    Event::UdpEncap(frame, origin) => {
                        if let Some(reply) = engine.handle_explicit_udp_data(
                            encap_udp_handle,
                            origin,
                            &frame,
                            false,
                        ) {
                            if let Err(e) = encap_udp.try_send_to(&reply, origin.into()) {
                                warn!(error = %e, "UDP reply failed");
                            }
                        }
                    }
                    Event::UdpIo(frame, origin) => {
                        engine.handle_received_connected_data(&frame, origin);
                    }
                }
            }
            _ = tick.tick() => {
                engine.manage_connections(TIMER_TICK_MS);
                mirror_output_to_input(&mut engine);
            }
        }
    }

    engine.shutdown();
    Ok(())
}

/// The sample device behavior: whatever the scanner writes to the
/// output assembly is produced back on the input assembly.
fn mirror_output_to_input(engine: &mut Engine<TokioSocketDriver, SampleApplication>) {
    let output = engine
        .assembly_data(OUTPUT_ASSEMBLY)
        .map(<[u8]>::to_vec);
    if let (Some(output), Some(input)) = (output, engine.assembly_data_mut(INPUT_ASSEMBLY)) {
        input.copy_from_slice(&output);
    }
}
