mod headless;

use anyhow::Result;

pub struct Options {
    pub verbose: bool,
    pub color: bool,
}

pub trait Frontend {
    fn set_up(&mut self, options: &Options) -> Result<()>;
    fn tear_down(&mut self) -> Result<()>;
}

pub fn set_up(options: Options) -> Result<Box<dyn Frontend>> {
    let mut logger = headless::HeadlessLogger {};
    logger.set_up(&options)?;
    Ok(Box::new(logger))
}
