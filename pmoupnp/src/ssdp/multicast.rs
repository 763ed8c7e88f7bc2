//! Liaison des sockets multicast SSDP et GENA.
//!
//! Une adresse locale IPv4 rejoint un seul groupe ; une adresse IPv6 rejoint
//! les groupes des quatre portées sur son interface, la portée d'origine d'un
//! paquet n'étant pas connue à l'avance. Chaque groupe rejoint avec succès est
//! quitté lors de la libération, et le socket est fermé une seule fois.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV6, UdpSocket};

use pmoutils::{AddressCandidate, AddressFamily, LINK_LOCAL_DISTANCE, SITE_LOCAL_DISTANCE};
use socket2::{Domain, Protocol, Socket, Type};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::{
    GENA_MULTICAST_PORT, GENA_MULTICAST_V4, GENA_MULTICAST_V6_GLOBAL, GENA_MULTICAST_V6_LINK_LOCAL,
    GENA_MULTICAST_V6_NODE_LOCAL, GENA_MULTICAST_V6_SITE_LOCAL, SSDP_MULTICAST_V4,
    SSDP_MULTICAST_V6_GLOBAL, SSDP_MULTICAST_V6_LINK_LOCAL, SSDP_MULTICAST_V6_NODE_LOCAL,
    SSDP_MULTICAST_V6_SITE_LOCAL, SSDP_PORT,
};

#[derive(Debug, Error)]
pub enum MulticastError {
    #[error("Cannot create multicast socket for {address}: {source}")]
    Socket {
        address: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("Cannot bind multicast socket to {address}: {source}")]
    Bind {
        address: SocketAddr,
        #[source]
        source: io::Error,
    },
}

/// Trafic multicast transporté par un socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MulticastChannel {
    /// Découverte SSDP
    Discovery,
    /// Événements GENA multicast (UPnP 1.1)
    Eventing,
}

impl MulticastChannel {
    pub fn port(self) -> u16 {
        match self {
            MulticastChannel::Discovery => SSDP_PORT,
            MulticastChannel::Eventing => GENA_MULTICAST_PORT,
        }
    }

    pub fn ipv4_group(self) -> Ipv4Addr {
        match self {
            MulticastChannel::Discovery => SSDP_MULTICAST_V4,
            MulticastChannel::Eventing => GENA_MULTICAST_V4,
        }
    }

    pub fn ipv6_group(self, scope: MulticastScope) -> Option<Ipv6Addr> {
        let groups = match self {
            MulticastChannel::Discovery => [
                SSDP_MULTICAST_V6_NODE_LOCAL,
                SSDP_MULTICAST_V6_LINK_LOCAL,
                SSDP_MULTICAST_V6_SITE_LOCAL,
                SSDP_MULTICAST_V6_GLOBAL,
            ],
            MulticastChannel::Eventing => [
                GENA_MULTICAST_V6_NODE_LOCAL,
                GENA_MULTICAST_V6_LINK_LOCAL,
                GENA_MULTICAST_V6_SITE_LOCAL,
                GENA_MULTICAST_V6_GLOBAL,
            ],
        };
        match scope {
            MulticastScope::Ipv4 => None,
            MulticastScope::NodeLocal => Some(groups[0]),
            MulticastScope::LinkLocal => Some(groups[1]),
            MulticastScope::SiteLocal => Some(groups[2]),
            MulticastScope::Global => Some(groups[3]),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MulticastScope {
    Ipv4,
    NodeLocal,
    LinkLocal,
    SiteLocal,
    Global,
}

const IPV6_SCOPES: [MulticastScope; 4] = [
    MulticastScope::NodeLocal,
    MulticastScope::LinkLocal,
    MulticastScope::SiteLocal,
    MulticastScope::Global,
];

/// Interface sur laquelle un groupe est rejoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GroupInterface {
    /// Adresse locale IPv4 (`0.0.0.0` laisse le système choisir)
    V4(Ipv4Addr),
    /// Index d'interface IPv6 (0 laisse le système choisir)
    V6(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MulticastGroup {
    pub address: IpAddr,
    pub scope: MulticastScope,
    pub interface: GroupInterface,
}

/// Groupes à rejoindre pour une adresse locale.
///
/// IPv4 : le groupe unique du canal. IPv6 : les quatre portées, sur
/// l'interface désignée par le `scope_id` de l'adresse.
pub fn groups_for(local: &AddressCandidate, channel: MulticastChannel) -> Vec<MulticastGroup> {
    match local.address {
        IpAddr::V4(v4) => vec![MulticastGroup {
            address: IpAddr::V4(channel.ipv4_group()),
            scope: MulticastScope::Ipv4,
            interface: GroupInterface::V4(v4),
        }],
        IpAddr::V6(_) => IPV6_SCOPES
            .iter()
            .filter_map(|scope| {
                channel.ipv6_group(*scope).map(|group| MulticastGroup {
                    address: IpAddr::V6(group),
                    scope: *scope,
                    interface: GroupInterface::V6(local.scope_id),
                })
            })
            .collect(),
    }
}

/// Groupe vers lequel envoyer depuis une adresse locale.
///
/// IPv6 : link-local → groupe de lien ; site-local, ou toute adresse si
/// `site_local_operation` est actif → groupe de site ; loopback → groupe de
/// nœud ; sinon groupe global.
pub fn multicast_address_for_interface(
    local: &IpAddr,
    channel: MulticastChannel,
    site_local_operation: bool,
) -> IpAddr {
    let scope = match local {
        IpAddr::V4(_) => return IpAddr::V4(channel.ipv4_group()),
        IpAddr::V6(v6) if v6.is_loopback() => MulticastScope::NodeLocal,
        IpAddr::V6(_) => match pmoutils::link_distance(local) {
            LINK_LOCAL_DISTANCE => MulticastScope::LinkLocal,
            SITE_LOCAL_DISTANCE => MulticastScope::SiteLocal,
            _ if site_local_operation => MulticastScope::SiteLocal,
            _ => MulticastScope::Global,
        },
    };
    channel
        .ipv6_group(scope)
        .map(IpAddr::V6)
        .unwrap_or(IpAddr::V4(channel.ipv4_group()))
}

/// Opérations de socket nécessaires à la gestion des groupes.
pub trait GroupSocket {
    fn join_group(&self, group: &MulticastGroup) -> io::Result<()>;
    fn leave_group(&self, group: &MulticastGroup) -> io::Result<()>;
    fn enable_packet_info(&self, family: AddressFamily) -> io::Result<()>;
    fn close(self) -> io::Result<()>;
}

/// Socket UDP réel, créé avec socket2.
#[derive(Debug)]
pub struct UdpGroupSocket {
    socket: Socket,
}

impl UdpGroupSocket {
    /// Crée un socket lié au port du canal.
    ///
    /// Sous Unix le socket est lié à l'adresse « any » de la famille, le
    /// noyau filtrant le multicast reçu sur un socket lié à une adresse
    /// unicast ; ailleurs il est lié à l'adresse locale.
    fn bind(local: &AddressCandidate, port: u16) -> Result<Self, MulticastError> {
        let bind_ip = if cfg!(unix) {
            local.family.unspecified()
        } else {
            local.address
        };
        let address = match bind_ip {
            IpAddr::V6(v6) if !v6.is_unspecified() => {
                SocketAddr::V6(SocketAddrV6::new(v6, port, 0, local.scope_id))
            }
            ip => SocketAddr::new(ip, port),
        };

        let socket = Socket::new(Domain::for_address(address), Type::DGRAM, Some(Protocol::UDP))
            .map_err(|source| MulticastError::Socket { address, source })?;
        let configure = |socket: &Socket| -> io::Result<()> {
            socket.set_reuse_address(true)?;
            if address.is_ipv6() {
                socket.set_only_v6(true)?;
            }
            Ok(())
        };
        configure(&socket).map_err(|source| MulticastError::Socket { address, source })?;
        socket
            .bind(&address.into())
            .map_err(|source| MulticastError::Bind { address, source })?;

        // Interface d'émission : échec non bloquant
        let outgoing = match local.address {
            IpAddr::V4(v4) if !v4.is_unspecified() => socket.set_multicast_if_v4(&v4),
            IpAddr::V6(_) if local.scope_id != 0 => socket.set_multicast_if_v6(local.scope_id),
            _ => Ok(()),
        };
        if let Err(e) = outgoing {
            warn!(local = %local.address, "Cannot select outgoing multicast interface: {}", e);
        }

        debug!(address = %address, local = %local.address, "Multicast socket bound");
        Ok(Self { socket })
    }

    /// Duplique le descripteur en `UdpSocket` pour la boucle de réception.
    pub fn try_clone_udp(&self) -> io::Result<UdpSocket> {
        Ok(self.socket.try_clone()?.into())
    }

    pub fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize> {
        self.socket.send_to(buf, &target.into())
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket
            .local_addr()?
            .as_socket()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "not an IP socket"))
    }
}

impl GroupSocket for UdpGroupSocket {
    fn join_group(&self, group: &MulticastGroup) -> io::Result<()> {
        match (group.address, group.interface) {
            (IpAddr::V4(addr), GroupInterface::V4(interface)) => {
                self.socket.join_multicast_v4(&addr, &interface)
            }
            (IpAddr::V6(addr), GroupInterface::V6(index)) => self.socket.join_multicast_v6(&addr, index),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "group and interface families differ",
            )),
        }
    }

    fn leave_group(&self, group: &MulticastGroup) -> io::Result<()> {
        match (group.address, group.interface) {
            (IpAddr::V4(addr), GroupInterface::V4(interface)) => {
                self.socket.leave_multicast_v4(&addr, &interface)
            }
            (IpAddr::V6(addr), GroupInterface::V6(index)) => {
                self.socket.leave_multicast_v6(&addr, index)
            }
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "group and interface families differ",
            )),
        }
    }

    #[cfg(any(target_os = "linux", target_os = "android"))]
    fn enable_packet_info(&self, family: AddressFamily) -> io::Result<()> {
        use std::os::fd::AsRawFd;

        let (level, name) = match family {
            AddressFamily::Ipv4 => (libc::IPPROTO_IP, libc::IP_PKTINFO),
            AddressFamily::Ipv6 => (libc::IPPROTO_IPV6, libc::IPV6_RECVPKTINFO),
        };
        let enable: libc::c_int = 1;
        // SAFETY: the descriptor is owned by `self.socket` and the option value
        // points to a live c_int of the advertised size.
        let rc = unsafe {
            libc::setsockopt(
                self.socket.as_raw_fd(),
                level,
                name,
                &enable as *const libc::c_int as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if rc == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    fn enable_packet_info(&self, _family: AddressFamily) -> io::Result<()> {
        Ok(())
    }

    fn close(self) -> io::Result<()> {
        drop(self.socket);
        Ok(())
    }
}

/// Socket lié à un canal multicast, avec les groupes effectivement rejoints.
///
/// La libération ([`MulticastBinding::leave`] ou `Drop`) quitte chaque groupe
/// rejoint, ignore les erreurs de retrait et ferme toujours le socket.
pub struct MulticastBinding<S: GroupSocket> {
    socket: Option<S>,
    local: AddressCandidate,
    channel: MulticastChannel,
    joined: Vec<MulticastGroup>,
}

impl<S: GroupSocket> MulticastBinding<S> {
    /// Rejoint les groupes du canal sur un socket déjà lié.
    ///
    /// Un refus d'adhésion est signalé et n'interrompt pas la liaison : le
    /// socket reste utilisable sur les groupes rejoints.
    pub fn join_with(socket: S, local: AddressCandidate, channel: MulticastChannel) -> Self {
        if let Err(e) = socket.enable_packet_info(local.family) {
            warn!(local = %local.address, "Cannot enable packet information: {}", e);
        }

        let mut joined = Vec::new();
        for group in groups_for(&local, channel) {
            match socket.join_group(&group) {
                Ok(()) => {
                    debug!(group = %group.address, local = %local.address, "Joined multicast group");
                    joined.push(group);
                }
                Err(e) => {
                    warn!(
                        group = %group.address,
                        local = %local.address,
                        "Cannot join multicast group: {}", e
                    );
                }
            }
        }

        Self {
            socket: Some(socket),
            local,
            channel,
            joined,
        }
    }

    pub fn socket(&self) -> Option<&S> {
        self.socket.as_ref()
    }

    pub fn local(&self) -> &AddressCandidate {
        &self.local
    }

    pub fn channel(&self) -> MulticastChannel {
        self.channel
    }

    pub fn joined_groups(&self) -> &[MulticastGroup] {
        &self.joined
    }

    /// Quitte les groupes et ferme le socket.
    pub fn leave(mut self) {
        self.release();
    }

    fn release(&mut self) {
        let Some(socket) = self.socket.take() else {
            return;
        };
        for group in self.joined.drain(..) {
            if let Err(e) = socket.leave_group(&group) {
                debug!(group = %group.address, local = %self.local.address, "Cannot leave multicast group: {}", e);
            }
        }
        if let Err(e) = socket.close() {
            warn!(local = %self.local.address, "Error closing multicast socket: {}", e);
        }
    }
}

impl<S: GroupSocket> Drop for MulticastBinding<S> {
    fn drop(&mut self) {
        self.release();
    }
}

/// Lie un socket UDP au port du canal et rejoint ses groupes.
///
/// Seule l'impossibilité de créer ou de lier le socket est une erreur.
pub fn bind_multicast(
    local: &AddressCandidate,
    channel: MulticastChannel,
) -> Result<MulticastBinding<UdpGroupSocket>, MulticastError> {
    let socket = UdpGroupSocket::bind(local, channel.port())?;
    let binding = MulticastBinding::join_with(socket, local.clone(), channel);
    info!(
        local = %local.address,
        port = channel.port(),
        groups = binding.joined_groups().len(),
        "✅ Multicast listener ready"
    );
    Ok(binding)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct Journal {
        joined: Vec<IpAddr>,
        left: Vec<IpAddr>,
        closed: usize,
        packet_info: usize,
    }

    struct FakeSocket {
        journal: Arc<Mutex<Journal>>,
        refuse_join: Vec<IpAddr>,
        refuse_leave: bool,
    }

    impl FakeSocket {
        fn new(journal: &Arc<Mutex<Journal>>) -> Self {
            Self {
                journal: journal.clone(),
                refuse_join: Vec::new(),
                refuse_leave: false,
            }
        }
    }

    impl GroupSocket for FakeSocket {
        fn join_group(&self, group: &MulticastGroup) -> io::Result<()> {
            if self.refuse_join.contains(&group.address) {
                return Err(io::Error::new(io::ErrorKind::AddrNotAvailable, "refused"));
            }
            self.journal.lock().unwrap().joined.push(group.address);
            Ok(())
        }

        fn leave_group(&self, group: &MulticastGroup) -> io::Result<()> {
            self.journal.lock().unwrap().left.push(group.address);
            if self.refuse_leave {
                return Err(io::Error::new(io::ErrorKind::NotConnected, "invalid socket"));
            }
            Ok(())
        }

        fn enable_packet_info(&self, _family: AddressFamily) -> io::Result<()> {
            self.journal.lock().unwrap().packet_info += 1;
            Ok(())
        }

        fn close(self) -> io::Result<()> {
            self.journal.lock().unwrap().closed += 1;
            Ok(())
        }
    }

    fn candidate(text: &str, scope_id: u32) -> AddressCandidate {
        AddressCandidate::new(text.parse().unwrap()).with_scope_id(scope_id)
    }

    #[test]
    fn test_groups_for_ipv4() {
        let groups = groups_for(&candidate("192.168.1.2", 0), MulticastChannel::Discovery);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].address, IpAddr::V4(SSDP_MULTICAST_V4));
        assert_eq!(
            groups[0].interface,
            GroupInterface::V4(Ipv4Addr::new(192, 168, 1, 2))
        );
    }

    #[test]
    fn test_groups_for_ipv6_covers_all_scopes() {
        let groups = groups_for(&candidate("fe80::1", 3), MulticastChannel::Eventing);
        let addresses: Vec<String> = groups.iter().map(|g| g.address.to_string()).collect();
        assert_eq!(addresses, vec!["ff01::130", "ff02::130", "ff05::130", "ff0e::130"]);
        assert!(groups.iter().all(|g| g.interface == GroupInterface::V6(3)));
    }

    #[test]
    fn test_ipv6_loopback_joins_all_scopes_and_sends_node_local() {
        let loopback = candidate("::1", 1);
        let groups = groups_for(&loopback, MulticastChannel::Discovery);
        let addresses: Vec<String> = groups.iter().map(|g| g.address.to_string()).collect();
        assert_eq!(addresses, vec!["ff01::c", "ff02::c", "ff05::c", "ff0e::c"]);
        assert_eq!(
            multicast_address_for_interface(&loopback.address, MulticastChannel::Discovery, true)
                .to_string(),
            "ff01::c"
        );
    }

    #[test]
    fn test_multicast_address_for_interface() {
        let link: IpAddr = "fe80::1".parse().unwrap();
        let site: IpAddr = "fd00::1".parse().unwrap();
        let global: IpAddr = "2001:db8::1".parse().unwrap();
        let v4: IpAddr = "10.0.0.1".parse().unwrap();
        let discovery = MulticastChannel::Discovery;

        assert_eq!(multicast_address_for_interface(&v4, discovery, false).to_string(), "239.255.255.250");
        assert_eq!(multicast_address_for_interface(&link, discovery, true).to_string(), "ff02::c");
        assert_eq!(multicast_address_for_interface(&site, discovery, false).to_string(), "ff05::c");
        assert_eq!(multicast_address_for_interface(&global, discovery, false).to_string(), "ff0e::c");
        assert_eq!(multicast_address_for_interface(&global, discovery, true).to_string(), "ff05::c");
        assert_eq!(
            multicast_address_for_interface(&global, MulticastChannel::Eventing, false).to_string(),
            "ff0e::130"
        );
    }

    #[test]
    fn test_join_leave_symmetry() {
        let journal = Arc::new(Mutex::new(Journal::default()));
        let binding = MulticastBinding::join_with(
            FakeSocket::new(&journal),
            candidate("fe80::1", 2),
            MulticastChannel::Discovery,
        );
        assert_eq!(binding.joined_groups().len(), 4);
        binding.leave();

        let journal = journal.lock().unwrap();
        assert_eq!(journal.joined, journal.left);
        assert_eq!(journal.closed, 1);
        assert_eq!(journal.packet_info, 1);
    }

    #[test]
    fn test_refused_join_is_not_left() {
        let journal = Arc::new(Mutex::new(Journal::default()));
        let mut socket = FakeSocket::new(&journal);
        socket.refuse_join = vec![IpAddr::V6(SSDP_MULTICAST_V6_GLOBAL)];

        let binding =
            MulticastBinding::join_with(socket, candidate("fe80::1", 2), MulticastChannel::Discovery);
        assert_eq!(binding.joined_groups().len(), 3);
        drop(binding);

        let journal = journal.lock().unwrap();
        assert_eq!(journal.left.len(), 3);
        assert!(!journal.left.contains(&IpAddr::V6(SSDP_MULTICAST_V6_GLOBAL)));
        assert_eq!(journal.closed, 1);
    }

    #[test]
    fn test_close_happens_once_even_if_leave_fails() {
        let journal = Arc::new(Mutex::new(Journal::default()));
        let mut socket = FakeSocket::new(&journal);
        socket.refuse_leave = true;

        let binding =
            MulticastBinding::join_with(socket, candidate("10.0.0.2", 0), MulticastChannel::Eventing);
        binding.leave();

        let journal = journal.lock().unwrap();
        assert_eq!(journal.left, vec![IpAddr::V4(GENA_MULTICAST_V4)]);
        assert_eq!(journal.closed, 1);
    }
}
