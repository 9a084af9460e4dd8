//! 把 lua/ 下的脚本嵌入二进制
//!
//! 生成 `$OUT_DIR/scripts.rs`：
//! - `LIB_PRELUDE`：lib.lua，所有操作共用的前缀
//! - `SCRIPTS`：其余每个 `<op>.lua`，按名字排序
//!
//! 缺少 lib.lua 或脚本为空时直接中止构建。

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

const LIB_NAME: &str = "lib";

fn main() {
    let manifest_dir = PathBuf::from(std::env::var("CARGO_MANIFEST_DIR").unwrap());
    let scripts_dir = manifest_dir.join("lua");
    let out_dir = std::env::var("OUT_DIR").unwrap();
    let dest_path = Path::new(&out_dir).join("scripts.rs");

    // 新增或删除脚本时重新生成
    println!("cargo:rerun-if-changed=lua");

    let mut scripts = BTreeMap::new();
    let entries = fs::read_dir(&scripts_dir)
        .unwrap_or_else(|e| panic!("无法读取 {}: {}", scripts_dir.display(), e));

    for entry in entries.filter_map(|e| e.ok()) {
        let path = entry.path();
        if path.extension().and_then(|ext| ext.to_str()) != Some("lua") {
            continue;
        }
        println!("cargo:rerun-if-changed={}", path.display());

        let name = path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .unwrap_or_else(|| panic!("脚本文件名不是 UTF-8: {}", path.display()))
            .to_string();
        let body = fs::read_to_string(&path)
            .unwrap_or_else(|e| panic!("无法读取 {}: {}", path.display(), e));
        if body.trim().is_empty() {
            panic!("脚本 {} 为空", path.display());
        }
        if scripts.insert(name.clone(), path).is_some() {
            panic!("脚本 {} 重复", name);
        }
    }

    let lib = scripts
        .remove(LIB_NAME)
        .unwrap_or_else(|| panic!("缺少 {}/{}.lua", scripts_dir.display(), LIB_NAME));
    if scripts.is_empty() {
        panic!("{} 下没有任何操作脚本", scripts_dir.display());
    }

    let entries: Vec<String> = scripts
        .iter()
        .map(|(name, path)| {
            format!(
                "    ({:?}, include_str!({:?}))",
                name,
                path.display().to_string()
            )
        })
        .collect();

    let mut f = fs::File::create(&dest_path).expect("无法创建 scripts.rs");
    writeln!(
        f,
        "/// 所有操作共用的前缀（lib.lua）\n\
         pub const LIB_PRELUDE: &str = include_str!({:?});\n\n\
         /// 原子操作脚本（名字, 内容），按名字排序\n\
         pub const SCRIPTS: &[(&str, &str)] = &[\n{}\n];",
        lib.display().to_string(),
        entries.join(",\n")
    )
    .expect("无法写入 scripts.rs");
}
