use std::{
    collections::HashMap,
    error, fmt, fs, io,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
    str::FromStr,
};

/// Maps private tunnel-side addresses to the public UDP endpoints of their peers.
/// Populated once at startup and read-only afterwards.
#[derive(Default)]
pub struct PeerTable {
    v4: HashMap<Ipv4Addr, SocketAddr>,
    v6: HashMap<Ipv6Addr, SocketAddr>,
}

impl PeerTable {
    pub fn new() -> PeerTable {
        PeerTable::default()
    }

    pub fn load(path: &str) -> Result<PeerTable, PeerError> {
        let text = fs::read_to_string(path)?;
        Self::parse(&text)
    }

    /// Parses records in the `<private-ip> <public-ip>:<port>` format, one per line.
    pub fn parse(text: &str) -> Result<PeerTable, PeerError> {
        let mut table = PeerTable::new();
        for (i, line) in text.lines().enumerate() {
            let line_number = i + 1;
            let line = match line.split_once('#') {
                Some((record, _comment)) => record,
                None => line,
            }
            .trim();
            if line.is_empty() {
                continue;
            }
            let mut fields = line.split_whitespace();
            let (private_addr, public_addr) = match (fields.next(), fields.next(), fields.next()) {
                (Some(private_addr), Some(public_addr), None) => (private_addr, public_addr),
                _ => return Err(PeerError::Parse(line_number, "Expected two fields")),
            };
            let private_addr = IpAddr::from_str(private_addr)
                .map_err(|_| PeerError::Parse(line_number, "Invalid private IP address"))?;
            let public_addr = SocketAddr::from_str(public_addr)
                .map_err(|_| PeerError::Parse(line_number, "Invalid public socket address"))?;
            table.insert(private_addr, public_addr)?;
        }
        Ok(table)
    }

    pub fn insert(&mut self, private_addr: IpAddr, public_addr: SocketAddr) -> Result<(), PeerError> {
        let duplicate = match (private_addr, public_addr) {
            (IpAddr::V4(private_addr), SocketAddr::V4(_)) => {
                self.v4.insert(private_addr, public_addr).is_some()
            }
            (IpAddr::V6(private_addr), SocketAddr::V6(_)) => {
                self.v6.insert(private_addr, public_addr).is_some()
            }
            _ => return Err(PeerError::FamilyMismatch(private_addr, public_addr)),
        };
        if duplicate {
            Err(PeerError::Duplicate(private_addr))
        } else {
            Ok(())
        }
    }

    pub fn lookup_v4(&self, private_addr: Ipv4Addr) -> Option<SocketAddr> {
        self.v4.get(&private_addr).copied()
    }

    pub fn lookup_v6(&self, private_addr: Ipv6Addr) -> Option<SocketAddr> {
        self.v6.get(&private_addr).copied()
    }

    pub fn lookup(&self, private_addr: IpAddr) -> Option<SocketAddr> {
        match private_addr {
            IpAddr::V4(private_addr) => self.lookup_v4(private_addr),
            IpAddr::V6(private_addr) => self.lookup_v6(private_addr),
        }
    }

    pub fn len(&self) -> usize {
        self.v4.len() + self.v6.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug)]
pub enum PeerError {
    Parse(usize, &'static str),
    Duplicate(IpAddr),
    FamilyMismatch(IpAddr, SocketAddr),
    Io(io::Error),
}

impl fmt::Display for PeerError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Parse(line, msg) => write!(f, "Line {line}: {msg}"),
            Self::Duplicate(addr) => write!(f, "Duplicate peer for private address {addr}"),
            Self::FamilyMismatch(private_addr, public_addr) => write!(
                f,
                "Private address {private_addr} and public address {public_addr} have different families"
            ),
            Self::Io(e) => write!(f, "IO error: {e}"),
        }
    }
}

impl error::Error for PeerError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Self::Parse(_, _) | Self::Duplicate(_) | Self::FamilyMismatch(_, _) => None,
            Self::Io(err) => Some(err),
        }
    }
}

impl From<io::Error> for PeerError {
    fn from(err: io::Error) -> PeerError {
        Self::Io(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_records_with_comments() {
        let table = PeerTable::parse(
            "# private public\n\
             10.0.0.2 192.0.2.10:5000\n\
             \n\
             10.0.0.3   192.0.2.11:5001   # second peer\n\
             fd00::2 [2001:db8::10]:5000\n",
        )
        .unwrap();
        assert_eq!(table.len(), 3);
        assert_eq!(
            table.lookup_v4(Ipv4Addr::new(10, 0, 0, 3)),
            Some(SocketAddr::from_str("192.0.2.11:5001").unwrap())
        );
        assert_eq!(
            table.lookup(IpAddr::from_str("fd00::2").unwrap()),
            Some(SocketAddr::from_str("[2001:db8::10]:5000").unwrap())
        );
        assert_eq!(table.lookup_v4(Ipv4Addr::new(10, 0, 0, 4)), None);
    }

    #[test]
    fn reject_duplicate_private_address() {
        let result = PeerTable::parse("10.0.0.2 192.0.2.10:5000\n10.0.0.2 192.0.2.11:5000\n");
        assert!(matches!(result, Err(PeerError::Duplicate(_))));
    }

    #[test]
    fn reject_family_mismatch() {
        let result = PeerTable::parse("10.0.0.2 [2001:db8::10]:5000\n");
        assert!(matches!(result, Err(PeerError::FamilyMismatch(_, _))));
    }

    #[test]
    fn reject_malformed_lines() {
        assert!(matches!(
            PeerTable::parse("10.0.0.2\n"),
            Err(PeerError::Parse(1, _))
        ));
        assert!(matches!(
            PeerTable::parse("# header\n10.0.0.2 192.0.2.10\n"),
            Err(PeerError::Parse(2, _))
        ));
        assert!(matches!(
            PeerTable::parse("10.0.0.x 192.0.2.10:5000\n"),
            Err(PeerError::Parse(1, _))
        ));
        assert!(matches!(
            PeerTable::parse("10.0.0.2 192.0.2.10:5000 extra\n"),
            Err(PeerError::Parse(1, _))
        ));
    }

    #[test]
    fn empty_table() {
        let table = PeerTable::parse("# nothing here\n\n").unwrap();
        assert!(table.is_empty());
    }
}
