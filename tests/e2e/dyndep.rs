use crate::*;

/// A dyndep file produced during the build reveals that an edge depends on
/// another generated file; the edge waits until that file is produced.
#[cfg(unix)]
#[test]
fn dyndep_discovers_generated_input() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "build.ninja",
        "
rule copy
  command = cp $in $out
rule touch
  command = touch $out
build dd: copy dd.in
build gen: touch
build out: touch || dd
  dyndep = dd
",
    )?;
    space.write(
        "dd.in",
        "ninja_dyndep_version = 1\nbuild out: dyndep | gen\n",
    )?;

    // All three edges run: the dyndep producer, the discovered dependency,
    // and the target itself.
    let out = space.run_expect(&mut kunai_command(vec!["out"]))?;
    assert_output_contains(&out, "ran 3 tasks");
    assert!(space.read("out").is_ok());
    assert!(space.read("gen").is_ok());

    // On rebuild the dyndep file is already clean and loads during the
    // scan; nothing is out of date.
    let out = space.run_expect(&mut kunai_command(vec!["out"]))?;
    assert_output_contains(&out, "no work to do");
    Ok(())
}

/// A dyndep file can also reveal plain source files as inputs: nothing
/// produces them, but they still drive dirtiness.
#[cfg(unix)]
#[test]
fn dyndep_discovers_source_input() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "build.ninja",
        "
rule copy
  command = cp $in $out
rule touch
  command = touch $out
build dd: copy dd.in
build out: touch || dd
  dyndep = dd
",
    )?;
    space.write(
        "dd.in",
        "ninja_dyndep_version = 1\nbuild out: dyndep | ext\n",
    )?;
    space.write("ext", "")?;

    let out = space.run_expect(&mut kunai_command(vec!["out"]))?;
    assert_output_contains(&out, "ran 2 tasks");

    let out = space.run_expect(&mut kunai_command(vec!["out"]))?;
    assert_output_contains(&out, "no work to do");

    // The discovered dependency is live: touching it reruns the edge.
    space.touch("ext")?;
    let out = space.run_expect(&mut kunai_command(vec!["out"]))?;
    assert_output_contains(&out, "ran 1 task,");
    Ok(())
}

/// A dyndep file naming an output whose edge doesn't declare it is an
/// error.
#[cfg(unix)]
#[test]
fn dyndep_must_match_declaring_edge() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "build.ninja",
        "
rule copy
  command = cp $in $out
rule touch
  command = touch $out
build dd: copy dd.in
build out: touch || dd
  dyndep = dd
build other: touch
",
    )?;
    space.write(
        "dd.in",
        "ninja_dyndep_version = 1\nbuild other: dyndep\n",
    )?;
    let out = space.run(&mut kunai_command(vec!["out"]))?;
    assert!(!out.status.success());
    assert_output_contains(&out, "does not have a dyndep binding");
    Ok(())
}
