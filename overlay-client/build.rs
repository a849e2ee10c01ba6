// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: MIT

use std::path::PathBuf;

extern crate shaderc;

fn main() {
    let out_dir = std::env::var("OUT_DIR").map(PathBuf::from).unwrap();
    let shader_dir = out_dir.join("shaders");
    std::fs::create_dir_all(&shader_dir).expect("failed to create shader output directory");

    let compiler = shaderc::Compiler::new().expect("failed to initialize shaderc");
    let mut options = shaderc::CompileOptions::new().expect("failed to create shaderc options");
    options.set_optimization_level(shaderc::OptimizationLevel::Performance);
    options.set_target_env(shaderc::TargetEnv::Vulkan, shaderc::EnvVersion::Vulkan1_2 as u32);

    compile_shader(
        &compiler,
        &options,
        "src/shaders/composite.vert",
        shaderc::ShaderKind::Vertex,
        &shader_dir.join("composite.vert.spv"),
    );

    compile_shader(
        &compiler,
        &options,
        "src/shaders/composite.frag",
        shaderc::ShaderKind::Fragment,
        &shader_dir.join("composite.frag.spv"),
    );
}

fn compile_shader(
    compiler: &shaderc::Compiler,
    options: &shaderc::CompileOptions,
    in_path: &str,
    kind: shaderc::ShaderKind,
    out_path: &PathBuf,
) {
    let source = std::fs::read_to_string(in_path).expect("failed to read shader source");

    let artifact = compiler
        .compile_into_spirv(&source, kind, in_path, "main", Some(options))
        .expect("shader compilation failed");

    std::fs::write(out_path, artifact.as_binary_u8()).expect("failed to write shader bytecode");

    println!("cargo:rerun-if-changed={}", in_path);
}
