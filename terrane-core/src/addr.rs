//! Stable, comparable addresses for modules, resources, resource instances
//! and provider configurations.
//!
//! Every address has a canonical string form, produced by `Display` and
//! accepted by `FromStr`. The string form is also the serialized form, so
//! addresses can be used as keys of JSON objects in state and plan files.
//!
//! ```text
//! module.network[0].aws_subnet.private["b"]
//! data.aws_ami.base
//! module.network[0].provider.aws.west
//! ```

use anyhow::{bail, Context as _, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::{
    fmt::{self, Display},
    str::FromStr,
};

/// The repetition key of an instance: none for single blocks, an integer for
/// `count`, a string for `for_each`.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum InstanceKey {
    #[default]
    None,
    Int(i64),
    Str(String),
}
impl InstanceKey {
    pub fn is_none(&self) -> bool {
        matches!(self, InstanceKey::None)
    }
}
impl Display for InstanceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstanceKey::None => Ok(()),
            InstanceKey::Int(i) => write!(f, "[{}]", i),
            InstanceKey::Str(s) => write!(f, "[{}]", quote(s)),
        }
    }
}

fn quote(s: &str) -> String {
    serde_json::to_string(s).unwrap_or_else(|_| format!("\"{}\"", s))
}

/// One step of a module instance path, e.g. `module.network[0]`.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ModuleStep {
    pub name: String,
    pub key: InstanceKey,
}
impl Display for ModuleStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "module.{}{}", self.name, self.key)
    }
}

/// Path of a module instance. The empty path is the root module.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ModulePath(pub Vec<ModuleStep>);
impl ModulePath {
    pub fn root() -> Self {
        ModulePath(Vec::new())
    }
    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }
    pub fn child(&self, name: &str, key: InstanceKey) -> ModulePath {
        let mut steps = self.0.clone();
        steps.push(ModuleStep {
            name: name.to_string(),
            key,
        });
        ModulePath(steps)
    }
    /// The parent module path and the last step, or `None` for the root.
    pub fn parent(&self) -> Option<(ModulePath, &ModuleStep)> {
        let (last, init) = self.0.split_last()?;
        Some((ModulePath(init.to_vec()), last))
    }
    /// Whether `self` is `other` or one of its ancestors. A step without a
    /// key in `self` matches any key in `other`.
    pub fn contains(&self, other: &ModulePath) -> bool {
        self.0.len() <= other.0.len()
            && self.0.iter().zip(other.0.iter()).all(|(mine, theirs)| {
                mine.name == theirs.name && (mine.key.is_none() || mine.key == theirs.key)
            })
    }
    /// Prefix used when rendering addresses inside this module.
    fn prefix(&self) -> String {
        let mut s = String::new();
        for step in &self.0 {
            s.push_str(&step.to_string());
            s.push('.');
        }
        s
    }
}
impl Display for ModulePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_root() {
            return write!(f, "<root>");
        }
        let s = self.prefix();
        write!(f, "{}", s.trim_end_matches('.'))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ResourceMode {
    Managed,
    Data,
}

/// A resource block inside a module, e.g. `aws_instance.web`.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ResourceAddr {
    pub mode: ResourceMode,
    pub type_: String,
    pub name: String,
}
impl ResourceAddr {
    pub fn managed(type_: &str, name: &str) -> Self {
        ResourceAddr {
            mode: ResourceMode::Managed,
            type_: type_.to_string(),
            name: name.to_string(),
        }
    }
    pub fn data(type_: &str, name: &str) -> Self {
        ResourceAddr {
            mode: ResourceMode::Data,
            type_: type_.to_string(),
            name: name.to_string(),
        }
    }
    /// The provider type implied by the resource type: the part before the
    /// first underscore.
    pub fn implied_provider(&self) -> &str {
        self.type_
            .split_once('_')
            .map(|(p, _)| p)
            .unwrap_or(&self.type_)
    }
}
impl Display for ResourceAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.mode {
            ResourceMode::Managed => write!(f, "{}.{}", self.type_, self.name),
            ResourceMode::Data => write!(f, "data.{}.{}", self.type_, self.name),
        }
    }
}

/// A resource block in a specific module instance.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AbsResourceAddr {
    pub module: ModulePath,
    pub resource: ResourceAddr,
}
impl AbsResourceAddr {
    pub fn instance(&self, key: InstanceKey) -> ResourceInstanceAddr {
        ResourceInstanceAddr {
            module: self.module.clone(),
            resource: self.resource.clone(),
            key,
        }
    }
}
impl Display for AbsResourceAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.module.prefix(), self.resource)
    }
}

/// The unit of planning and apply: one concrete resource object.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ResourceInstanceAddr {
    pub module: ModulePath,
    pub resource: ResourceAddr,
    pub key: InstanceKey,
}
impl ResourceInstanceAddr {
    pub fn root(resource: ResourceAddr, key: InstanceKey) -> Self {
        ResourceInstanceAddr {
            module: ModulePath::root(),
            resource,
            key,
        }
    }
    pub fn abs_resource(&self) -> AbsResourceAddr {
        AbsResourceAddr {
            module: self.module.clone(),
            resource: self.resource.clone(),
        }
    }
    pub fn is_data(&self) -> bool {
        self.resource.mode == ResourceMode::Data
    }
}
impl Display for ResourceInstanceAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.module.prefix(), self.resource, self.key)
    }
}

/// A provider configuration, optionally aliased, as declared in a module.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProviderConfigAddr {
    pub module: ModulePath,
    pub type_: String,
    pub alias: Option<String>,
}
impl ProviderConfigAddr {
    pub fn new(module: ModulePath, type_: &str, alias: Option<&str>) -> Self {
        ProviderConfigAddr {
            module,
            type_: type_.to_string(),
            alias: alias.map(str::to_string),
        }
    }
}
impl Display for ProviderConfigAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}provider.{}", self.module.prefix(), self.type_)?;
        if let Some(alias) = &self.alias {
            write!(f, ".{}", alias)?;
        }
        Ok(())
    }
}

/// Selects state entries for listing: a whole module, every instance of a
/// resource, or one instance.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AddrFilter {
    Module(ModulePath),
    Resource(AbsResourceAddr),
    Instance(ResourceInstanceAddr),
}
impl AddrFilter {
    pub fn matches(&self, addr: &ResourceInstanceAddr) -> bool {
        match self {
            AddrFilter::Module(module) => module.contains(&addr.module),
            AddrFilter::Resource(resource) => {
                resource.module == addr.module && resource.resource == addr.resource
            }
            AddrFilter::Instance(instance) => instance == addr,
        }
    }
}
impl FromStr for AddrFilter {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut tokens = Tokens::new(s)?;
        let module = tokens.module_path()?;
        if tokens.is_empty() {
            return Ok(AddrFilter::Module(module));
        }
        let resource = tokens.resource()?;
        let key = tokens.key();
        tokens.finish(s)?;
        Ok(match key {
            InstanceKey::None => AddrFilter::Resource(AbsResourceAddr { module, resource }),
            key => AddrFilter::Instance(ResourceInstanceAddr {
                module,
                resource,
                key,
            }),
        })
    }
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq)]
enum Token {
    Ident(String),
    Key(InstanceKey),
}

struct Tokens {
    tokens: std::collections::VecDeque<Token>,
}
impl Tokens {
    fn new(s: &str) -> Result<Tokens> {
        let mut tokens = std::collections::VecDeque::new();
        let mut chars = s.char_indices().peekable();
        let mut ident = String::new();
        while let Some((pos, c)) = chars.next() {
            match c {
                '.' => {
                    if !ident.is_empty() {
                        tokens.push_back(Token::Ident(std::mem::take(&mut ident)));
                    }
                }
                '[' => {
                    if !ident.is_empty() {
                        tokens.push_back(Token::Ident(std::mem::take(&mut ident)));
                    }
                    let rest = &s[pos + 1..];
                    let (key, consumed) = parse_key(rest)
                        .with_context(|| format!("invalid instance key in address {:?}", s))?;
                    tokens.push_back(Token::Key(key));
                    // skip the key text and the closing bracket
                    for _ in 0..rest[..consumed].chars().count() {
                        chars.next();
                    }
                }
                c if c.is_alphanumeric() || c == '_' || c == '-' => ident.push(c),
                c => bail!("unexpected character {:?} in address {:?}", c, s),
            }
        }
        if !ident.is_empty() {
            tokens.push_back(Token::Ident(ident));
        }
        if tokens.is_empty() {
            bail!("empty address");
        }
        Ok(Tokens { tokens })
    }

    fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    fn ident(&mut self) -> Result<String> {
        match self.tokens.pop_front() {
            Some(Token::Ident(s)) => Ok(s),
            Some(Token::Key(k)) => bail!("expected a name, found key {}", k),
            None => bail!("address ended unexpectedly"),
        }
    }

    fn peek_ident(&self, expected: &str) -> bool {
        matches!(self.tokens.front(), Some(Token::Ident(s)) if s == expected)
    }

    fn key(&mut self) -> InstanceKey {
        match self.tokens.front() {
            Some(Token::Key(_)) => match self.tokens.pop_front() {
                Some(Token::Key(k)) => k,
                _ => InstanceKey::None,
            },
            _ => InstanceKey::None,
        }
    }

    fn module_path(&mut self) -> Result<ModulePath> {
        let mut steps = Vec::new();
        while self.peek_ident("module") {
            self.tokens.pop_front();
            let name = self.ident()?;
            let key = self.key();
            steps.push(ModuleStep { name, key });
        }
        Ok(ModulePath(steps))
    }

    fn resource(&mut self) -> Result<ResourceAddr> {
        let mode = if self.peek_ident("data") {
            self.tokens.pop_front();
            ResourceMode::Data
        } else {
            ResourceMode::Managed
        };
        let type_ = self.ident()?;
        let name = self.ident()?;
        Ok(ResourceAddr { mode, type_, name })
    }

    fn finish(&self, s: &str) -> Result<()> {
        if !self.tokens.is_empty() {
            bail!("trailing components in address {:?}", s);
        }
        Ok(())
    }
}

/// Parse the inside of `[...]`, returning the key and the number of bytes
/// consumed including the closing bracket.
fn parse_key(s: &str) -> Result<(InstanceKey, usize)> {
    if s.starts_with('"') {
        let mut escaped = false;
        for (i, c) in s.char_indices().skip(1) {
            match c {
                '\\' if !escaped => escaped = true,
                '"' if !escaped => {
                    let key: String = serde_json::from_str(&s[..=i])?;
                    if !s[i + 1..].starts_with(']') {
                        bail!("expected ']' after string key");
                    }
                    return Ok((InstanceKey::Str(key), i + 2));
                }
                _ => escaped = false,
            }
        }
        bail!("unterminated string key")
    } else {
        let end = s.find(']').context("missing ']'")?;
        let n: i64 = s[..end]
            .trim()
            .parse()
            .with_context(|| format!("not an integer: {:?}", &s[..end]))?;
        Ok((InstanceKey::Int(n), end + 1))
    }
}

impl FromStr for ModulePath {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        if s.is_empty() || s == "<root>" {
            return Ok(ModulePath::root());
        }
        let mut tokens = Tokens::new(s)?;
        let path = tokens.module_path()?;
        tokens.finish(s)?;
        Ok(path)
    }
}

impl FromStr for AbsResourceAddr {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut tokens = Tokens::new(s)?;
        let module = tokens.module_path()?;
        let resource = tokens.resource()?;
        tokens.finish(s)?;
        Ok(AbsResourceAddr { module, resource })
    }
}

impl FromStr for ResourceInstanceAddr {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut tokens = Tokens::new(s)?;
        let module = tokens.module_path()?;
        let resource = tokens.resource()?;
        let key = tokens.key();
        tokens.finish(s)?;
        Ok(ResourceInstanceAddr {
            module,
            resource,
            key,
        })
    }
}

impl FromStr for ProviderConfigAddr {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut tokens = Tokens::new(s)?;
        let module = tokens.module_path()?;
        if tokens.ident()? != "provider" {
            bail!("provider address must contain 'provider': {:?}", s);
        }
        let type_ = tokens.ident()?;
        let alias = if tokens.is_empty() {
            None
        } else {
            Some(tokens.ident()?)
        };
        tokens.finish(s)?;
        Ok(ProviderConfigAddr {
            module,
            type_,
            alias,
        })
    }
}

/// Addresses are (de)serialized through their canonical string form.
macro_rules! string_serde {
    ($t:ty) => {
        impl Serialize for $t {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.collect_str(self)
            }
        }
        impl<'de> Deserialize<'de> for $t {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                s.parse().map_err(|e: anyhow::Error| {
                    serde::de::Error::custom(format!("{:#}", e))
                })
            }
        }
    };
}
string_serde!(ModulePath);
string_serde!(AbsResourceAddr);
string_serde!(ResourceInstanceAddr);
string_serde!(ProviderConfigAddr);
