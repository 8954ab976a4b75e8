// 该文件是 Jianshi （监视） 项目的一部分。
// src/training/service.rs - systemd 服务单元
//
// 本文件根据 Apache 许可证第 2.0 版（以下简称“许可证”）授权使用；
// 除非遵守该许可证条款，否则您不得使用本文件。
// 您可通过以下网址获取许可证副本：
// http://www.apache.org/licenses/LICENSE-2.0
// 除非适用法律要求或书面同意，根据本许可协议分发的软件均按“原样”提供，
// 不附带任何形式的明示或暗示的保证或条件。
// 有关许可权限与限制的具体条款，请参阅本许可协议。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, Wareless Group

use std::fmt::Write;
use std::path::Path;

pub const SERVICE_NAME: &str = "yolo-training.service";

/// 生成调度器的 systemd 单元文件内容
pub fn render_systemd_unit(
  exec: &Path,
  args: &[String],
  user: Option<&str>,
  working_dir: &Path,
) -> String {
  let mut exec_start = exec.display().to_string();
  for arg in args {
    exec_start.push(' ');
    exec_start.push_str(&quote(arg));
  }

  let mut unit = String::new();
  let _ = writeln!(unit, "[Unit]");
  let _ = writeln!(unit, "Description=YOLO Automated Training Service");
  let _ = writeln!(unit, "After=network.target");
  let _ = writeln!(unit);
  let _ = writeln!(unit, "[Service]");
  let _ = writeln!(unit, "ExecStart={exec_start}");
  let _ = writeln!(unit, "Restart=always");
  if let Some(user) = user {
    let _ = writeln!(unit, "User={user}");
  }
  let _ = writeln!(unit, "WorkingDirectory={}", working_dir.display());
  let _ = writeln!(unit);
  let _ = writeln!(unit, "[Install]");
  let _ = writeln!(unit, "WantedBy=multi-user.target");
  unit
}

fn quote(arg: &str) -> String {
  if arg.is_empty() || arg.contains(|c: char| c.is_whitespace() || c == '"') {
    format!("\"{}\"", arg.replace('\\', "\\\\").replace('"', "\\\""))
  } else {
    arg.to_string()
  }
}
