//! Zero-conf discovery of MPD servers on the local network.

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, info, warn};
use mdns_sd::{ServiceDaemon, ServiceEvent};
use tokio::sync::broadcast;

use crate::foreground::ForegroundHandle;
use crate::protocol::{Message, ServerMessage};
use crate::server_registry::{HttpDirectory, Server, ServerRegistry};
use crate::worker_pool::lock_or_recover;

pub const DEFAULT_SERVICE_TYPE: &str = "_mpd._tcp.local.";
const BROWSE_POLL: Duration = Duration::from_millis(250);

fn instance_name_from_fullname(fullname: &str, service_type: &str) -> String {
    let suffix = format!(".{}", service_type.trim_start_matches('.'));
    fullname
        .trim()
        .strip_suffix(suffix.as_str())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .unwrap_or(fullname)
        .trim_matches('.')
        .to_string()
}

/// Builds a server from the fields of a resolved service record.
///
/// The lowest IPv4 address is used for the connection; the advertised host
/// name is the fallback when the record carries none.
fn server_from_record(
    fullname: &str,
    hostname: &str,
    addresses_v4: &[Ipv4Addr],
    port: u16,
    service_type: &str,
    cover_url_template: Option<&str>,
) -> Option<Server> {
    let mut addresses = addresses_v4.to_vec();
    addresses.sort();
    let host = match addresses.first() {
        Some(address) => address.to_string(),
        None => hostname.trim_end_matches('.').to_string(),
    };
    if host.is_empty() || port == 0 {
        return None;
    }
    let mut name = instance_name_from_fullname(fullname, service_type);
    if name.is_empty() {
        name = host.clone();
    }
    let mut server = Server::new(name, host.clone(), port);
    if let Some(template) = cover_url_template.filter(|template| !template.is_empty()) {
        server = server.with_cover_strategy(Arc::new(HttpDirectory::new(
            template.replace("{host}", &host),
        )));
    }
    Some(server)
}

struct BrowseWorker {
    stop_requested: Arc<AtomicBool>,
    thread: JoinHandle<()>,
}

/// Browses for servers and feeds them into the registry.
///
/// Each newly resolved server is appended to the registry by a job on the
/// foreground queue, which also announces it on the bus when it was new.
pub struct ServerExplorer {
    service_type: String,
    cover_url_template: Option<String>,
    registry: Arc<Mutex<ServerRegistry>>,
    foreground: ForegroundHandle,
    bus_sender: broadcast::Sender<Message>,
    worker: Option<BrowseWorker>,
}

impl ServerExplorer {
    pub fn new(
        service_type: &str,
        cover_url_template: Option<String>,
        registry: Arc<Mutex<ServerRegistry>>,
        foreground: ForegroundHandle,
        bus_sender: broadcast::Sender<Message>,
    ) -> Self {
        Self {
            service_type: service_type.to_string(),
            cover_url_template,
            registry,
            foreground,
            bus_sender,
            worker: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.worker.is_some()
    }

    /// Starts browsing. Calling it while already running is a no-op.
    pub fn start(&mut self) -> Result<(), String> {
        if self.worker.is_some() {
            return Ok(());
        }
        let mdns = ServiceDaemon::new()
            .map_err(|err| format!("failed to start mDNS discovery daemon: {err}"))?;
        let browse_receiver = match mdns.browse(&self.service_type) {
            Ok(receiver) => receiver,
            Err(err) => {
                let _ = mdns.shutdown();
                return Err(format!("failed to browse {}: {err}", self.service_type));
            }
        };

        let stop_requested = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop_requested);
        let service_type = self.service_type.clone();
        let cover_url_template = self.cover_url_template.clone();
        let registry = Arc::clone(&self.registry);
        let foreground = self.foreground.clone();
        let bus_sender = self.bus_sender.clone();
        let thread = thread::Builder::new()
            .name("server-discovery".to_string())
            .spawn(move || {
                while !stop_flag.load(Ordering::SeqCst) {
                    let Ok(event) = browse_receiver.recv_timeout(BROWSE_POLL) else {
                        continue;
                    };
                    let ServiceEvent::ServiceResolved(service) = event else {
                        continue;
                    };
                    let addresses: Vec<Ipv4Addr> =
                        service.get_addresses_v4().iter().copied().collect();
                    let Some(server) = server_from_record(
                        service.get_fullname(),
                        service.get_hostname(),
                        &addresses,
                        service.get_port(),
                        &service_type,
                        cover_url_template.as_deref(),
                    ) else {
                        continue;
                    };
                    debug!("ServerExplorer: resolved {}", server);
                    let registry = Arc::clone(&registry);
                    let bus_sender = bus_sender.clone();
                    foreground.post(move || {
                        let added = lock_or_recover(&registry).add_discovered(server.clone());
                        if added {
                            let _ = bus_sender
                                .send(Message::Server(ServerMessage::ServerDiscovered(server)));
                        }
                    });
                }
                if let Err(err) = mdns.stop_browse(&service_type) {
                    debug!("ServerExplorer: failed to stop mDNS browse cleanly: {}", err);
                }
                let _ = mdns.shutdown();
            })
            .map_err(|err| format!("failed to spawn discovery thread: {err}"))?;

        info!("ServerExplorer: browsing for {}", self.service_type);
        self.worker = Some(BrowseWorker {
            stop_requested,
            thread,
        });
        let _ = self
            .bus_sender
            .send(Message::Server(ServerMessage::DiscoveryStarted));
        Ok(())
    }

    /// Stops browsing. Servers already delivered stay in the registry.
    pub fn stop(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };
        worker.stop_requested.store(true, Ordering::SeqCst);
        if worker.thread.join().is_err() {
            warn!("ServerExplorer: discovery thread panicked");
        }
        info!("ServerExplorer: stopped browsing for {}", self.service_type);
        let _ = self
            .bus_sender
            .send(Message::Server(ServerMessage::DiscoveryStopped));
    }
}

impl Drop for ServerExplorer {
    fn drop(&mut self) {
        self.stop();
    }
}
