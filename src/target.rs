/// Default RMCP port of a BMC.
pub const DEFAULT_IPMI_PORT: u16 = 623;

/// A managed host, resolved from the `[host.<name>]` and `[ipmi]` sections.
#[derive(Clone, PartialEq, Eq)]
pub struct Target {
    pub name: String,
    pub address: String,
    pub port: u16,
    pub username: String,
    password: String,
}

impl Target {
    pub fn new(name: String, address: String, username: String, password: String) -> Self {
        Self {
            name,
            address,
            port: DEFAULT_IPMI_PORT,
            username,
            password,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn password(&self) -> &str {
        &self.password
    }
}

impl std::fmt::Debug for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Target")
            .field("name", &self.name)
            .field("address", &self.address)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

impl std::fmt::Display for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({}:{})", self.name, self.address, self.port)
    }
}
