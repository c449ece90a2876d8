//! Holds the shader processing infrastructure for all kernels.
//!
//! Kernels live in `shaders/` and are handlebars templates. Permutations are
//! produced by rendering the template with a serializable config; `{{include}}`
//! pulls shared declarations in.

use std::collections::{HashMap, HashSet};

use handlebars::{Context, Handlebars, Helper, HelperDef, Output, RenderContext, RenderError};
use parking_lot::Mutex;
use rust_embed::RustEmbed;
use serde::Serialize;

#[derive(RustEmbed)]
#[folder = "$CARGO_MANIFEST_DIR/shaders"]
struct HerdShaderSources;

pub struct ShaderPreProcessor {
    files: HashMap<String, String>,
}

impl ShaderPreProcessor {
    pub fn new() -> Self {
        let mut v = Self { files: HashMap::new() };
        v.add_shaders_embed::<HerdShaderSources>("herd");
        v
    }

    pub fn add_shaders_embed<T: RustEmbed>(&mut self, prefix: &str) {
        for file in T::iter() {
            let Some(embedded) = T::get(&file) else {
                continue;
            };
            match String::from_utf8(embedded.data.into_owned()) {
                Ok(contents) => {
                    self.files.insert(format!("{prefix}/{file}"), contents);
                }
                Err(_) => log::error!("Shader {prefix}/{file} is not valid utf-8, skipping"),
            }
        }
    }

    pub fn add_shader(&mut self, name: &str, contents: &str) {
        self.files.insert(name.to_owned(), contents.to_owned());
    }

    pub fn files(&self) -> std::collections::hash_map::Keys<'_, String, String> {
        self.files.keys()
    }

    pub fn get(&self, name: &str) -> Option<&String> {
        self.files.get(name)
    }

    pub fn render_shader<T>(&self, base: &str, config: &T) -> Result<String, RenderError>
    where
        T: Serialize,
    {
        let mut registry = Handlebars::new();
        registry.set_strict_mode(true);
        registry.set_dev_mode(cfg!(debug_assertions));
        registry.register_escape_fn(handlebars::no_escape);
        registry.register_helper("include", Box::new(ShaderIncluder::new(base, &self.files)));

        let contents = self.files.get(base).ok_or_else(|| {
            RenderError::new(format!(
                "Base shader {base} is not registered. All registered shaders: {}",
                registered_shader_string(&self.files)
            ))
        })?;

        registry.render_template(contents, config)
    }
}

impl Default for ShaderPreProcessor {
    fn default() -> Self {
        Self::new()
    }
}

fn registered_shader_string(files: &HashMap<String, String>) -> String {
    let mut v: Vec<_> = files.keys().cloned().collect();
    v.sort_unstable();
    v.join(", ")
}

struct ShaderIncluder<'a> {
    files: &'a HashMap<String, String>,
    include_state: Mutex<HashSet<String>>,
}
impl<'a> ShaderIncluder<'a> {
    fn new(base: &str, files: &'a HashMap<String, String>) -> Self {
        Self {
            files,
            include_state: Mutex::new({
                let mut set = HashSet::new();
                set.insert(base.to_owned());
                set
            }),
        }
    }
}
impl<'a> HelperDef for ShaderIncluder<'a> {
    fn call<'reg: 'rc, 'rc>(
        &self,
        h: &Helper<'reg, 'rc>,
        r: &'reg Handlebars<'reg>,
        ctx: &'rc Context,
        _rc: &mut RenderContext<'reg, 'rc>,
        out: &mut dyn Output,
    ) -> handlebars::HelperResult {
        let file_name_value = h
            .param(0)
            .ok_or_else(|| RenderError::new("include helper must have a single argument for the include path"))?
            .value();
        let file_name = match file_name_value {
            handlebars::JsonValue::String(s) => s,
            _ => return Err(RenderError::new("include helper's first argument must be a string")),
        };

        {
            // Each file is only included once, later includes are no-ops.
            let mut include_status = self.include_state.lock();
            if !include_status.insert(file_name.clone()) {
                return Ok(());
            }
        }

        let contents = self.files.get(file_name).ok_or_else(|| {
            RenderError::new(format!(
                "Included file \"{file_name}\" is not registered. All registered files: {}",
                registered_shader_string(self.files)
            ))
        })?;

        out.write(&r.render_template(contents, ctx.data())?)?;

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use serde::Serialize;

    use super::ShaderPreProcessor;

    #[derive(Serialize)]
    struct Config {
        enabled: bool,
    }

    #[test]
    fn includes_are_deduplicated() {
        let mut spp = ShaderPreProcessor::new();
        spp.add_shader("test/common", "let x = 1;\n");
        spp.add_shader(
            "test/base",
            "{{include \"test/common\"}}{{include \"test/common\"}}{{#if enabled}}on{{else}}off{{/if}}",
        );

        let on = spp.render_shader("test/base", &Config { enabled: true }).unwrap();
        assert_eq!(on, "let x = 1;\non");
        let off = spp.render_shader("test/base", &Config { enabled: false }).unwrap();
        assert_eq!(off, "let x = 1;\noff");
    }

    #[test]
    fn missing_base_is_an_error() {
        let spp = ShaderPreProcessor::new();
        assert!(spp.render_shader("herd/nope.wgsl", &Config { enabled: true }).is_err());
    }
}
