/// 启动选项
///
/// 全部来自环境变量，取值为整数开关：
/// - `OPFUSE_SHOW_OPTION`：默认 0，置 1 时打印全部选项的取值
/// - `OPFUSE_VERBOSE`：默认 0，>= 1 时图转储提升到 info 级别
/// - `OPFUSE_LLGA`：默认 0，置 1 时即使图未量化也运行量化 pass
/// - `OPFUSE_VERIFY`：默认 0，置 1 时在 pass 前后校验图
///
/// 无法解析的取值按未设置处理，使用默认值。

use std::fmt;

pub const ENV_SHOW_OPTION: &str = "OPFUSE_SHOW_OPTION";
pub const ENV_VERBOSE: &str = "OPFUSE_VERBOSE";
pub const ENV_LLGA: &str = "OPFUSE_LLGA";
pub const ENV_VERIFY: &str = "OPFUSE_VERIFY";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Settings {
    pub verbose_level: i32,
    pub llga_enabled: bool,
    pub verify_graph: bool,
}

impl Settings {
    /// 从进程环境读取
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// 从任意键值来源读取（测试用）
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let read = |name: &str| -> Option<i32> {
            lookup(name).and_then(|raw| raw.trim().parse::<i32>().ok())
        };

        let settings = Settings {
            verbose_level: read(ENV_VERBOSE).unwrap_or(0),
            llga_enabled: read(ENV_LLGA).is_some_and(|v| v != 0),
            verify_graph: read(ENV_VERIFY).is_some_and(|v| v != 0),
        };

        if read(ENV_SHOW_OPTION).is_some_and(|v| v != 0) {
            log::info!(target: "opfuse::settings", "launch options:\n{}", settings);
        }
        settings
    }

    /// 图转储使用的日志级别
    pub fn dump_level(&self) -> log::Level {
        if self.verbose_level >= 1 {
            log::Level::Info
        } else {
            log::Level::Debug
        }
    }
}

impl fmt::Display for Settings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, " ** {}: {}", ENV_VERBOSE, self.verbose_level)?;
        writeln!(f, " ** {}: {}", ENV_LLGA, self.llga_enabled as i32)?;
        write!(f, " ** {}: {}", ENV_VERIFY, self.verify_graph as i32)
    }
}
