//! The validated configuration tree the engine consumes.

use anyhow::{bail, Context as _, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use terrane_core::{
    addr::{ModulePath, ResourceAddr, ResourceMode},
    value::Value,
};

use crate::expr::Expr;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Configuration {
    pub root: ModuleConfig,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleConfig {
    #[serde(default)]
    pub variables: BTreeMap<String, VariableDecl>,
    #[serde(default)]
    pub resources: Vec<ResourceConfig>,
    #[serde(default)]
    pub providers: Vec<ProviderBlock>,
    #[serde(default)]
    pub module_calls: Vec<ModuleCall>,
    #[serde(default)]
    pub outputs: BTreeMap<String, Expr>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariableDecl {
    #[serde(default)]
    pub default: Option<Value>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Managed,
    Data,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceConfig {
    #[serde(default)]
    pub mode: Mode,
    #[serde(rename = "type")]
    pub type_: String,
    pub name: String,
    /// Alias of the provider configuration to use, if not the default one.
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub count: Option<Expr>,
    #[serde(default)]
    pub for_each: Option<Expr>,
    #[serde(default)]
    pub config: Expr,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub lifecycle: Lifecycle,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lifecycle {
    #[serde(default)]
    pub create_before_destroy: bool,
    #[serde(default)]
    pub prevent_destroy: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderBlock {
    #[serde(rename = "type")]
    pub type_: String,
    #[serde(default)]
    pub alias: Option<String>,
    #[serde(default)]
    pub config: Expr,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleCall {
    pub name: String,
    pub module: ModuleConfig,
    #[serde(default)]
    pub inputs: BTreeMap<String, Expr>,
    #[serde(default)]
    pub count: Option<Expr>,
    #[serde(default)]
    pub for_each: Option<Expr>,
    #[serde(default)]
    pub depends_on: Vec<String>,
}

/// The target of a `depends_on` entry.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum DependsOn {
    Resource(ResourceAddr),
    ModuleCall(String),
}

impl DependsOn {
    pub fn parse(s: &str) -> Result<DependsOn> {
        if let Some(name) = s.strip_prefix("module.") {
            if name.is_empty() || name.contains(['.', '[']) {
                bail!("depends_on must name a whole module call: {:?}", s);
            }
            return Ok(DependsOn::ModuleCall(name.to_string()));
        }
        let parts: Vec<&str> = s.split('.').collect();
        match parts.as_slice() {
            ["data", type_, name] => Ok(DependsOn::Resource(ResourceAddr::data(type_, name))),
            [type_, name] if !type_.is_empty() && !name.is_empty() => {
                Ok(DependsOn::Resource(ResourceAddr::managed(type_, name)))
            }
            _ => bail!("depends_on must name a resource or a module call: {:?}", s),
        }
    }
}

impl ResourceConfig {
    pub fn addr(&self) -> ResourceAddr {
        ResourceAddr {
            mode: match self.mode {
                Mode::Managed => ResourceMode::Managed,
                Mode::Data => ResourceMode::Data,
            },
            type_: self.type_.clone(),
            name: self.name.clone(),
        }
    }

    pub fn depends_on(&self) -> Result<Vec<DependsOn>> {
        self.depends_on.iter().map(|s| DependsOn::parse(s)).collect()
    }
}

impl ModuleCall {
    pub fn depends_on(&self) -> Result<Vec<DependsOn>> {
        self.depends_on.iter().map(|s| DependsOn::parse(s)).collect()
    }
}

impl ModuleConfig {
    pub fn resource(&self, addr: &ResourceAddr) -> Option<&ResourceConfig> {
        self.resources.iter().find(|r| &r.addr() == addr)
    }

    pub fn module_call(&self, name: &str) -> Option<&ModuleCall> {
        self.module_calls.iter().find(|c| c.name == name)
    }

    pub fn provider(&self, type_: &str, alias: Option<&str>) -> Option<&ProviderBlock> {
        self.providers
            .iter()
            .find(|p| p.type_ == type_ && p.alias.as_deref() == alias)
    }

    fn validate(&self, path: &str) -> Result<()> {
        let mut seen = BTreeSet::new();
        for r in &self.resources {
            let addr = r.addr();
            if !seen.insert(addr.clone()) {
                bail!("{}: duplicate resource {}", path, addr);
            }
            if r.count.is_some() && r.for_each.is_some() {
                bail!("{}: {} sets both count and for_each", path, addr);
            }
            r.depends_on()
                .with_context(|| format!("{}: in {}", path, addr))?;
        }
        let mut seen = BTreeSet::new();
        for p in &self.providers {
            if !seen.insert((&p.type_, &p.alias)) {
                bail!("{}: duplicate provider configuration for {}", path, p.type_);
            }
        }
        let mut seen = BTreeSet::new();
        for c in &self.module_calls {
            if !seen.insert(&c.name) {
                bail!("{}: duplicate module call {}", path, c.name);
            }
            if c.count.is_some() && c.for_each.is_some() {
                bail!("{}: module.{} sets both count and for_each", path, c.name);
            }
            for name in c.inputs.keys() {
                if !c.module.variables.contains_key(name) {
                    bail!("{}: module.{} has no variable {:?}", path, c.name, name);
                }
            }
            c.depends_on()
                .with_context(|| format!("{}: in module.{}", path, c.name))?;
            c.module.validate(&format!("{}.module.{}", path, c.name))?;
        }
        Ok(())
    }
}

impl Configuration {
    pub fn from_json(json: serde_json::Value) -> Result<Configuration> {
        let config: Configuration =
            serde_json::from_value(json).context("decoding configuration")?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &std::path::Path) -> Result<Configuration> {
        let file = std::fs::File::open(path)
            .with_context(|| format!("opening configuration {}", path.display()))?;
        let json = serde_json::from_reader(std::io::BufReader::new(file))
            .with_context(|| format!("reading configuration {}", path.display()))?;
        Self::from_json(json)
    }

    pub fn validate(&self) -> Result<()> {
        self.root.validate("<root>")
    }

    /// The configuration of a module instance. Instance keys are ignored:
    /// all instances of a call share one configuration.
    pub fn module(&self, path: &ModulePath) -> Option<&ModuleConfig> {
        let mut module = &self.root;
        for step in &path.0 {
            module = &module.module_call(&step.name)?.module;
        }
        Some(module)
    }
}
