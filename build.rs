use std::{env, error::Error, fs};

// The render shader is specialized per particle shape.
static SHAPES: [&str; 3] = ["circle", "square", "image"];

// All shaders reside in the 'src/shaders' directory. Files starting with an
// underscore are partials which are only pulled in through `include`.
fn generate_shaders() -> std::result::Result<(), Box<dyn Error>> {
    let tera = tera::Tera::new("src/shaders/*.wgsl")?;
    println!("cargo:rerun-if-changed=src/shaders/");
    let output_path = env::var("OUT_DIR")?;
    fs::create_dir_all(format!("{}/shaders/", output_path))?;
    for file in fs::read_dir("src/shaders")? {
        let file = file?;
        if file.path().extension().and_then(|e| e.to_str()) != Some("wgsl") {
            continue;
        }
        let file = file.file_name();
        let file_name = file.to_str().ok_or("shader file name is not utf-8")?;
        println!("cargo:rerun-if-changed=src/shaders/{}", file_name);
        if file_name.starts_with('_') {
            continue;
        }
        if file_name == "render.wgsl" {
            for shape in SHAPES.iter() {
                let mut context = tera::Context::new();
                context.insert("shape", shape);
                let result = tera.render(file_name, &context)?;
                fs::write(
                    format!("{}/shaders/render_{}.wgsl", output_path, shape),
                    result,
                )?;
            }
        } else {
            let result = tera.render(file_name, &tera::Context::new())?;
            fs::write(format!("{}/shaders/{}", output_path, file_name), result)?;
        }
    }
    Ok(())
}

fn main() {
    if let Err(err) = generate_shaders() {
        // panic here for a nicer error message, otherwise it will
        // be flattened to one line for some reason
        panic!("Unable to generate shaders\n{}", err);
    }
}
