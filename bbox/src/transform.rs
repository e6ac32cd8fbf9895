use super::{Rect, XYXY};
use crate::{common::*, RectNum};

/// Per-axis affine map `x' = x * sx + tx`, `y' = y * sy + ty`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Transform<T> {
    pub sx: T,
    pub sy: T,
    pub tx: T,
    pub ty: T,
}

impl<T> Transform<T>
where
    T: Copy + Num + PartialOrd,
{
    pub fn from_rects<R>(src: &R, tgt: &R) -> Self
    where
        R: Rect<Type = T>,
    {
        let sx = tgt.w() / src.w();
        let sy = tgt.h() / src.h();
        let tx = tgt.x1() - src.x1() * sx;
        let ty = tgt.y1() - src.y1() * sy;

        Self { sx, sy, tx, ty }
    }

    /// Maps a `[w, h]` image into a `[w, h]` target with aspect ratio kept
    /// and the leftover border split evenly on both sides.
    pub fn from_sizes_letterbox(src_size: [T; 2], tgt_size: [T; 2]) -> Self {
        let [src_w, src_h] = src_size;
        let [tgt_w, tgt_h] = tgt_size;

        let (new_w, new_h) = if tgt_h * src_w <= tgt_w * src_h {
            (src_w * tgt_h / src_h, tgt_h)
        } else {
            (tgt_w, src_h * tgt_w / src_w)
        };

        let two = T::one() + T::one();
        let off_x = (tgt_w - new_w) / two;
        let off_y = (tgt_h - new_h) / two;

        let src = XYXY::from_xyxy([T::zero(), T::zero(), src_w, src_h]);
        let tgt = XYXY::from_xyxy([off_x, off_y, off_x + new_w, off_y + new_h]);

        Self::from_rects(&src, &tgt)
    }
}

impl<T> Transform<T>
where
    T: Copy + Num + Neg<Output = T>,
{
    pub fn inverse(&self) -> Self {
        Self {
            sx: T::one() / self.sx,
            sy: T::one() / self.sy,
            tx: -self.tx / self.sx,
            ty: -self.ty / self.sy,
        }
    }
}

impl<T> Mul<&XYXY<T>> for &Transform<T>
where
    T: Copy + Num,
{
    type Output = XYXY<T>;

    fn mul(self, rhs: &XYXY<T>) -> Self::Output {
        rhs.transform(self)
    }
}
