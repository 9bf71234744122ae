// 4x4 matrix helpers
// Column-major storage, the layout WGSL expects for mat4x4<f32> uniforms

use serde::{Deserialize, Serialize};
use std::ops::Mul;

/// Column-major 4x4 matrix used for texture transforms and per-target MVPs.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, bytemuck::Pod, bytemuck::Zeroable)]
pub struct Mat4(pub [f32; 16]);

impl Mat4 {
    pub const IDENTITY: Mat4 = Mat4([
        1.0, 0.0, 0.0, 0.0, //
        0.0, 1.0, 0.0, 0.0, //
        0.0, 0.0, 1.0, 0.0, //
        0.0, 0.0, 0.0, 1.0,
    ]);

    pub fn from_cols_array(cols: [f32; 16]) -> Self {
        Self(cols)
    }

    pub fn to_cols_array(&self) -> [f32; 16] {
        self.0
    }

    /// Non-uniform scale along the three axes.
    pub fn scale(sx: f32, sy: f32, sz: f32) -> Self {
        let mut m = Self::IDENTITY;
        m.0[0] = sx;
        m.0[5] = sy;
        m.0[10] = sz;
        m
    }

    pub fn translation(tx: f32, ty: f32, tz: f32) -> Self {
        let mut m = Self::IDENTITY;
        m.0[12] = tx;
        m.0[13] = ty;
        m.0[14] = tz;
        m
    }

    /// Counter-clockwise rotation around Z, in degrees.
    ///
    /// Right angles are snapped so that 90/180/270 rotations stay exact.
    pub fn rotation_z(degrees: f32) -> Self {
        let (sin, cos) = match degrees.rem_euclid(360.0) {
            d if d == 0.0 => (0.0, 1.0),
            d if d == 90.0 => (1.0, 0.0),
            d if d == 180.0 => (0.0, -1.0),
            d if d == 270.0 => (-1.0, 0.0),
            d => d.to_radians().sin_cos(),
        };
        let mut m = Self::IDENTITY;
        m.0[0] = cos;
        m.0[1] = sin;
        m.0[4] = -sin;
        m.0[5] = cos;
        m
    }

    /// Element at `row`, `col`.
    pub fn get(&self, row: usize, col: usize) -> f32 {
        self.0[col * 4 + row]
    }

    pub fn is_identity(&self) -> bool {
        *self == Self::IDENTITY
    }

    pub fn approx_eq(&self, other: &Mat4, epsilon: f32) -> bool {
        self.0
            .iter()
            .zip(other.0.iter())
            .all(|(a, b)| (a - b).abs() <= epsilon)
    }
}

impl Default for Mat4 {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl Mul for Mat4 {
    type Output = Mat4;

    fn mul(self, rhs: Mat4) -> Mat4 {
        let mut out = [0.0f32; 16];
        for col in 0..4 {
            for row in 0..4 {
                out[col * 4 + row] = (0..4)
                    .map(|k| self.0[k * 4 + row] * rhs.0[col * 4 + k])
                    .sum();
            }
        }
        Mat4(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_is_neutral() {
        let m = Mat4::translation(1.0, 2.0, 3.0) * Mat4::scale(2.0, 3.0, 1.0);
        assert_eq!(m * Mat4::IDENTITY, m);
        assert_eq!(Mat4::IDENTITY * m, m);
    }

    #[test]
    fn test_column_major_layout() {
        let m = Mat4::translation(5.0, 6.0, 7.0);
        assert_eq!(m.get(0, 3), 5.0);
        assert_eq!(m.get(1, 3), 6.0);
        assert_eq!(m.get(2, 3), 7.0);
    }

    #[test]
    fn test_scale_then_translate_order() {
        // T * S applies the scale first
        let m = Mat4::translation(1.0, 0.0, 0.0) * Mat4::scale(2.0, 2.0, 1.0);
        assert_eq!(m.get(0, 0), 2.0);
        assert_eq!(m.get(0, 3), 1.0);
    }

    #[test]
    fn test_right_angle_rotations_are_exact() {
        let quarter = Mat4::rotation_z(90.0);
        assert_eq!(quarter * quarter * quarter * quarter, Mat4::IDENTITY);
        assert_eq!(Mat4::rotation_z(360.0), Mat4::IDENTITY);
        assert_eq!(Mat4::rotation_z(-90.0), Mat4::rotation_z(270.0));
    }

    #[test]
    fn test_arbitrary_rotation_round_trips() {
        let m = Mat4::rotation_z(30.0) * Mat4::rotation_z(-30.0);
        assert!(m.approx_eq(&Mat4::IDENTITY, 1e-6));
    }
}
