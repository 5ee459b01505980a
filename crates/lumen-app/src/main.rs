// SPDX-License-Identifier: CEPL-1.0
#![deny(unsafe_op_in_unsafe_fn)]
use anyhow::{Context, Result};
use clap::Parser;
use lumen_core::{init_tracing, load_config, EngineConfig};
use lumen_math::{
    GenericUniform, GlobalUniform, MaterialBindings, Mat4, TransformUniform, Vec2, Vec3, Vec4,
    VertexFormat,
};
use lumen_platform::main_window_attributes;
use lumen_render::{
    DrawCommand, FrameStatus, MeshHandle, RenderSize, Renderer, ShaderId, TextureAddress,
    TextureFormat, TextureUpload, Topology,
};
use lumen_render_vk::VkRenderer;
use std::path::PathBuf;
use std::time::Instant;
use tracing::{error, info};

use lumen_platform::winit::{
    application::ApplicationHandler,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, ControlFlow, EventLoop},
    window::{Window, WindowId},
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Engine configuration file
    #[arg(long, default_value = "lumen.toml")]
    config: PathBuf,

    /// Overrides `render.shader_root`
    #[arg(long)]
    shader_root: Option<String>,

    /// Disables the validation layer even in debug builds
    #[arg(long)]
    no_validation: bool,
}

/// Unit cube, four vertices per face so each face gets its own normal.
fn cube() -> (Vec<VertexFormat>, Vec<u32>) {
    let faces = [
        (Vec3::X, Vec3::Y),
        (Vec3::NEG_X, Vec3::Y),
        (Vec3::Y, Vec3::Z),
        (Vec3::NEG_Y, Vec3::Z),
        (Vec3::Z, Vec3::Y),
        (Vec3::NEG_Z, Vec3::Y),
    ];
    let mut vertices = Vec::with_capacity(24);
    let mut indices = Vec::with_capacity(36);
    for (normal, up) in faces {
        let right = up.cross(normal);
        let base = vertices.len() as u32;
        for (u, v) in [(0.0, 0.0), (1.0, 0.0), (1.0, 1.0), (0.0, 1.0)] {
            let pos = normal * 0.5 + right * (u - 0.5) + up * (v - 0.5);
            vertices.push(VertexFormat::new(pos, Vec2::new(u, v), normal));
        }
        indices.extend_from_slice(&[base, base + 1, base + 2, base, base + 2, base + 3]);
    }
    (vertices, indices)
}

/// 2×2 grey-level texture exercising the L8 swizzle.
const DEMO_TEXELS: [u8; 4] = [0x20, 0xE0, 0xE0, 0x20];

struct Demo {
    mesh: MeshHandle,
    material: GenericUniform,
}

struct App {
    cfg: EngineConfig,
    window: Option<Window>,
    renderer: Option<VkRenderer>,
    demo: Option<Demo>,
    render_size: RenderSize,
    started: Instant,
    frames: u32,
    last_fps_instant: Instant,
    draw_failed: bool,
}

impl App {
    fn init(&mut self, event_loop: &ActiveEventLoop) -> Result<()> {
        let window = event_loop
            .create_window(main_window_attributes("lumen", 1280, 720))
            .context("create_window")?;
        let size = window.inner_size();
        self.render_size = RenderSize {
            width: size.width,
            height: size.height,
        };

        let mut renderer = VkRenderer::new(&window, &window, self.render_size, &self.cfg.render)?;
        renderer.set_clear_color(self.cfg.render.clear_color);

        let (vertices, indices) = cube();
        let mesh = renderer.upload_mesh(&vertices, &indices)?;
        let slot = renderer.register_texture(&TextureUpload {
            width: 2,
            height: 2,
            format: TextureFormat::L8,
            data: &DEMO_TEXELS,
            generate_mips: true,
            address: TextureAddress::Repeat,
        })?;
        let material = GenericUniform::new(
            Vec4::new(1.0, 0.8, 0.6, 1.0),
            &MaterialBindings {
                diffuse: Some(slot.index()),
                ..Default::default()
            },
        );
        info!("demo ready: mesh {}, texture slot {}", mesh.0, slot.index());

        self.demo = Some(Demo { mesh, material });
        self.renderer = Some(renderer);
        self.window = Some(window);
        Ok(())
    }

    fn render(&mut self) -> Result<()> {
        let (Some(r), Some(demo)) = (self.renderer.as_mut(), self.demo.as_ref()) else {
            return Ok(());
        };
        let t = self.started.elapsed().as_secs_f32();
        let aspect = self.render_size.width.max(1) as f32 / self.render_size.height.max(1) as f32;
        let eye = Vec3::new(0.0, 1.5, 3.0);
        let globals = GlobalUniform {
            projection: Mat4::perspective_rh(60f32.to_radians(), aspect, 0.1, 100.0),
            view: Mat4::look_at_rh(eye, Vec3::ZERO, Vec3::Y),
            view_position: eye,
            time: t,
            ..Default::default()
        };

        if r.begin_frame(&globals)? == FrameStatus::NeedsResize {
            return Ok(());
        }
        if !self.draw_failed {
            let cmd = DrawCommand {
                shader: ShaderId::Generic,
                topology: Topology::TriangleList,
                mesh: demo.mesh,
                transform: TransformUniform::new(Mat4::from_rotation_y(t)),
                material: demo.material,
            };
            if let Err(e) = r.draw(&cmd) {
                // usually missing SPIR-V; keep presenting the clear color
                error!("demo draw disabled: {e:#}");
                self.draw_failed = true;
            }
        }
        if r.end_frame()? == FrameStatus::Ok {
            self.frames = self.frames.saturating_add(1);
        }
        Ok(())
    }
}

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_none() {
            if let Err(e) = self.init(event_loop) {
                error!("renderer init failed: {e:#}");
                event_loop.exit();
                return;
            }
        }
        event_loop.set_control_flow(ControlFlow::Poll);
        if let Some(w) = &self.window {
            w.request_redraw();
        }
    }

    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        window_id: WindowId,
        event: WindowEvent,
    ) {
        if let Some(window) = &self.window {
            if window_id != window.id() {
                return;
            }
        }

        match event {
            WindowEvent::CloseRequested => {
                info!("CloseRequested");
                // renderer before window: the surface must die first
                self.renderer = None;
                self.window = None;
                event_loop.exit();
            }

            WindowEvent::Resized(new_size) => {
                self.render_size = RenderSize {
                    width: new_size.width,
                    height: new_size.height,
                };
                info!(
                    "Resized → {}x{}",
                    self.render_size.width, self.render_size.height
                );
                if let Some(r) = &mut self.renderer {
                    if let Err(e) = r.resize(self.render_size) {
                        error!("resize failed: {e:#}");
                        event_loop.exit();
                    }
                }
            }

            WindowEvent::RedrawRequested => {
                if let Err(e) = self.render() {
                    error!("render error: {e:#}");
                    event_loop.exit();
                }
            }

            _ => {}
        }
    }

    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(w) = &self.window {
            w.request_redraw();
        }
        let now = Instant::now();
        if now.duration_since(self.last_fps_instant).as_secs_f32() >= 1.0 {
            info!("fps ~ {}", self.frames);
            self.frames = 0;
            self.last_fps_instant = now;
        }
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    let mut cfg = load_config(&args.config)?;
    init_tracing(&cfg.log);
    info!("config: {}", args.config.display());
    if let Some(root) = args.shader_root {
        cfg.render.shader_root = root;
    }
    if args.no_validation {
        cfg.render.validation = false;
    }

    let event_loop: EventLoop<()> = EventLoop::new()?;
    let mut app = App {
        cfg,
        window: None,
        renderer: None,
        demo: None,
        render_size: RenderSize {
            width: 1,
            height: 1,
        },
        started: Instant::now(),
        frames: 0,
        last_fps_instant: Instant::now(),
        draw_failed: false,
    };
    event_loop.run_app(&mut app)?;
    Ok(())
}
