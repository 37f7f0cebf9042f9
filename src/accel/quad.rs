//! Full-window textured quad (GL 3.3 core)

use std::ffi::CString;
use std::ptr;
use tracing::debug;
use xrdp_local_core::AccelError;

const VERTEX_SHADER: &str = r#"
    #version 330 core
    layout (location = 0) in vec2 aPos;
    layout (location = 1) in vec2 aTexCoord;

    out vec2 TexCoord;

    void main() {
        gl_Position = vec4(aPos, 0.0, 1.0);
        TexCoord = aTexCoord;
    }
"#;

const FRAGMENT_SHADER: &str = r#"
    #version 330 core
    out vec4 FragColor;

    in vec2 TexCoord;

    uniform sampler2D uTexture;

    void main() {
        FragColor = vec4(texture(uTexture, TexCoord).rgb, 1.0);
    }
"#;

/// Clip-space position + texcoord; the buffer's first row lands at the top.
const VERTICES: [f32; 16] = [
    -1.0, -1.0, 0.0, 1.0, //
    1.0, -1.0, 1.0, 1.0, //
    1.0, 1.0, 1.0, 0.0, //
    -1.0, 1.0, 0.0, 0.0, //
];

/// Shader, geometry and the texture the imported buffer is bound to.
///
/// Needs the owning context current for creation, drawing and drop.
pub struct TexturedQuad {
    program: u32,
    vao: u32,
    vbo: u32,
    texture: u32,
    texture_loc: i32,
    width: i32,
    height: i32,
}

impl TexturedQuad {
    /// # Safety
    /// A GL 3.3 context must be current and `gl` loaded for it.
    pub unsafe fn new(width: u32, height: u32) -> Result<Self, AccelError> {
        unsafe {
            let program = create_program()?;
            let texture_loc = gl::GetUniformLocation(program, c"uTexture".as_ptr());

            let mut vao = 0;
            let mut vbo = 0;
            gl::GenVertexArrays(1, &mut vao);
            gl::GenBuffers(1, &mut vbo);
            gl::BindVertexArray(vao);
            gl::BindBuffer(gl::ARRAY_BUFFER, vbo);
            gl::BufferData(
                gl::ARRAY_BUFFER,
                std::mem::size_of_val(&VERTICES) as isize,
                VERTICES.as_ptr() as *const _,
                gl::STATIC_DRAW,
            );
            let stride = 4 * std::mem::size_of::<f32>() as i32;
            gl::VertexAttribPointer(0, 2, gl::FLOAT, gl::FALSE, stride, ptr::null());
            gl::EnableVertexAttribArray(0);
            gl::VertexAttribPointer(1, 2, gl::FLOAT, gl::FALSE, stride, (2 * std::mem::size_of::<f32>()) as *const _);
            gl::EnableVertexAttribArray(1);
            gl::BindVertexArray(0);

            let mut texture = 0;
            gl::GenTextures(1, &mut texture);
            let quad = Self {
                program,
                vao,
                vbo,
                texture,
                texture_loc,
                width: width as i32,
                height: height as i32,
            };
            if texture == 0 {
                return Err(AccelError::backend("glGenTextures", "returned 0"));
            }
            gl::BindTexture(gl::TEXTURE_2D, texture);
            gl::TexParameteri(gl::TEXTURE_2D, gl::TEXTURE_MIN_FILTER, gl::NEAREST as i32);
            gl::TexParameteri(gl::TEXTURE_2D, gl::TEXTURE_MAG_FILTER, gl::NEAREST as i32);
            debug!("Quad ready, texture {}", texture);
            Ok(quad)
        }
    }

    /// Texture currently bound to `GL_TEXTURE_2D` after `new`.
    pub fn texture(&self) -> u32 {
        self.texture
    }

    /// # Safety
    /// The owning context must be current.
    pub unsafe fn draw(&self) {
        unsafe {
            gl::Viewport(0, 0, self.width, self.height);
            gl::UseProgram(self.program);
            gl::ActiveTexture(gl::TEXTURE0);
            gl::BindTexture(gl::TEXTURE_2D, self.texture);
            gl::Uniform1i(self.texture_loc, 0);
            gl::BindVertexArray(self.vao);
            gl::DrawArrays(gl::TRIANGLE_FAN, 0, 4);
            gl::BindVertexArray(0);
        }
    }
}

impl Drop for TexturedQuad {
    fn drop(&mut self) {
        // SAFETY: the session drops this before releasing its context.
        unsafe {
            if self.texture != 0 {
                gl::DeleteTextures(1, &self.texture);
            }
            gl::DeleteBuffers(1, &self.vbo);
            gl::DeleteVertexArrays(1, &self.vao);
            gl::DeleteProgram(self.program);
        }
    }
}

unsafe fn create_program() -> Result<u32, AccelError> {
    unsafe {
        let vs = compile_shader(VERTEX_SHADER, gl::VERTEX_SHADER)?;
        let fs = match compile_shader(FRAGMENT_SHADER, gl::FRAGMENT_SHADER) {
            Ok(fs) => fs,
            Err(e) => {
                gl::DeleteShader(vs);
                return Err(e);
            }
        };
        let program = link_program(vs, fs);
        gl::DeleteShader(vs);
        gl::DeleteShader(fs);
        program
    }
}

unsafe fn compile_shader(source: &str, shader_type: u32) -> Result<u32, AccelError> {
    let c_str = CString::new(source).map_err(|e| AccelError::backend("glShaderSource", e.to_string()))?;
    unsafe {
        let shader = gl::CreateShader(shader_type);
        gl::ShaderSource(shader, 1, &c_str.as_ptr(), ptr::null());
        gl::CompileShader(shader);

        let mut success = 0;
        gl::GetShaderiv(shader, gl::COMPILE_STATUS, &mut success);
        if success == 0 {
            let mut len = 0;
            gl::GetShaderiv(shader, gl::INFO_LOG_LENGTH, &mut len);
            let mut buffer = vec![0u8; len.max(1) as usize];
            gl::GetShaderInfoLog(shader, len, ptr::null_mut(), buffer.as_mut_ptr() as *mut _);
            gl::DeleteShader(shader);
            return Err(AccelError::backend(
                "glCompileShader",
                String::from_utf8_lossy(&buffer).trim_end_matches('\0').to_string(),
            ));
        }
        Ok(shader)
    }
}

unsafe fn link_program(vs: u32, fs: u32) -> Result<u32, AccelError> {
    unsafe {
        let program = gl::CreateProgram();
        gl::AttachShader(program, vs);
        gl::AttachShader(program, fs);
        gl::LinkProgram(program);

        let mut success = 0;
        gl::GetProgramiv(program, gl::LINK_STATUS, &mut success);
        if success == 0 {
            let mut len = 0;
            gl::GetProgramiv(program, gl::INFO_LOG_LENGTH, &mut len);
            let mut buffer = vec![0u8; len.max(1) as usize];
            gl::GetProgramInfoLog(program, len, ptr::null_mut(), buffer.as_mut_ptr() as *mut _);
            gl::DeleteProgram(program);
            return Err(AccelError::backend(
                "glLinkProgram",
                String::from_utf8_lossy(&buffer).trim_end_matches('\0').to_string(),
            ));
        }
        Ok(program)
    }
}
